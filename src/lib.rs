//! ExoRust firmware discovery and multiprocessor bring-up
//!
//! - ACPI root pointer validation and SDT lookup (`io::acpi`)
//! - Per-CPU registry and INIT-SIPI-SIPI AP bring-up (`smp`)
//! - Fatal escalation for configuration violations (`panic_handler`)
//!
//! Hardware is reached only through the capability traits in `io::memory`,
//! `io::apic`, `time` and `smp::bootstrap::Platform`, so the whole sequence
//! can be driven against fakes.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod io;
pub mod panic_handler;
pub mod smp;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{KernelError, KernelResult};
