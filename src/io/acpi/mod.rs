// ============================================================================
// src/io/acpi/mod.rs - ACPI Module
// ============================================================================
//!
//! ACPI table discovery for ExoRust
//!
//! ## Module Structure
//!
//! - `tables` - Firmware layouts (RSDP, SDT header) and checksums
//! - `parser` - RSDP validation, root table selection and table lookup
//! - `madt` - Processor topology from the MADT
//!
//! The kernel-wide instance is initialized once through [`init`]; other
//! subsystems query it with [`is_available`] and [`find_table`].

pub mod madt;
pub mod parser;
pub mod tables;

use spin::Once;
use x86_64::{PhysAddr, VirtAddr};

pub use madt::{LocalApicInfo, MadtTopology};
pub use parser::{Acpi, RootTable, find_rsdp, validate_rsdp};
pub use tables::{Rsdp, SdtHeader, TableRef, checksum, is_checksum_valid, signature};

use crate::io::memory::OffsetPhysicalMemory;

static ACPI: Once<Acpi<OffsetPhysicalMemory>> = Once::new();

/// Initialize the kernel-wide ACPI facility
///
/// `rsdp` is the root pointer handed over by the bootloader; when `None`
/// the BIOS areas are scanned. Later calls return the first instance.
///
/// # Safety
/// Physical memory below `memory_limit` must be mapped readable at
/// `phys_offset` for the rest of the kernel's lifetime.
pub unsafe fn init(
    phys_offset: VirtAddr,
    memory_limit: u64,
    rsdp: Option<PhysAddr>,
) -> &'static Acpi<OffsetPhysicalMemory> {
    ACPI.call_once(|| {
        // SAFETY: guaranteed by the caller.
        let memory = unsafe { OffsetPhysicalMemory::new(phys_offset, memory_limit) };
        match rsdp.map_or_else(|| find_rsdp(&memory), Ok) {
            Ok(address) => Acpi::init(memory, address),
            Err(e) => {
                log::warn!("[ACPI] Unavailable: {}", e);
                Acpi::unavailable(memory)
            }
        }
    })
}

/// The kernel-wide facility, if `init` has run
pub fn get() -> Option<&'static Acpi<OffsetPhysicalMemory>> {
    ACPI.get()
}

/// Whether a valid RSDP and root table were found
pub fn is_available() -> bool {
    get().is_some_and(Acpi::is_available)
}

/// Look up a table by signature in the kernel-wide facility
pub fn find_table(signature: &[u8; 4]) -> Option<TableRef> {
    get()?.find_table(signature)
}
