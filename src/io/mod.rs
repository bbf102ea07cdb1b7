//! I/O Subsystem
//!
//! Firmware tables, local interrupt controller, firmware memory access and
//! the serial logger.

pub mod acpi;
pub mod apic;
pub mod log;
pub mod memory;
