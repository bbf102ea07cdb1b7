// ============================================================================
// src/io/acpi/madt.rs - MADT Processor Topology
// ============================================================================
//!
//! MADT (Multiple APIC Description Table) のプロセッサ列挙。
//!
//! 有効な Processor Local APIC エントリ (type 0) をテーブル順に集め、
//! SMP 起動の `TopologySource` として提供する。

use alloc::vec::Vec;

use log::{debug, warn};
use x86_64::PhysAddr;

use super::parser::Acpi;
use super::tables::{SDT_HEADER_LENGTH, TableRef, signature};
use crate::error::AcpiError;
use crate::io::memory::PhysicalMemory;
use crate::smp::TopologySource;

/// MADT fixed fields after the SDT header: LAPIC address (u32) + flags (u32)
const MADT_FIXED_LENGTH: usize = 8;

/// MADT entry types
mod entry_type {
    pub const LOCAL_APIC: u8 = 0;
    pub const LOCAL_APIC_OVERRIDE: u8 = 5;
}

/// Local APIC flags (bit 0 = enabled, bit 1 = online capable)
const LAPIC_ENABLED: u32 = 1 << 0;
const LAPIC_ONLINE_CAPABLE: u32 = 1 << 1;

/// Local APIC information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApicInfo {
    /// ACPI Processor ID
    pub processor_id: u8,
    /// APIC ID
    pub apic_id: u8,
    /// Is online capable
    pub online_capable: bool,
}

/// Processors discovered through the MADT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MadtTopology {
    /// Local APIC physical address (type 5 override applied)
    pub local_apic_address: PhysAddr,
    /// Has legacy PICs (PCAT_COMPAT)
    pub has_legacy_pics: bool,
    /// Enabled processors in table order
    pub processors: Vec<LocalApicInfo>,
}

impl MadtTopology {
    /// Parse the MADT found through `acpi`
    pub fn parse<M: PhysicalMemory>(acpi: &Acpi<M>) -> Result<Self, AcpiError> {
        let table = acpi
            .find_table(&signature::MADT)
            .ok_or(AcpiError::TableNotFound)?;
        Self::from_table(acpi.memory(), &table)
    }

    /// Parse an already validated MADT
    pub fn from_table<M: PhysicalMemory>(memory: &M, table: &TableRef) -> Result<Self, AcpiError> {
        if table.header.len() < SDT_HEADER_LENGTH + MADT_FIXED_LENGTH {
            return Err(AcpiError::InvalidTable);
        }

        let body = table.body();
        let mut local_apic_address = memory.read_u32(body)? as u64;
        let flags = memory.read_u32(body + 4u64)?;

        let mut processors = Vec::new();
        let end = table.end().as_u64();
        let mut offset = body.as_u64() + MADT_FIXED_LENGTH as u64;

        while offset + 2 <= end {
            let at = PhysAddr::new(offset);
            let kind = memory.read_u8(at)?;
            let length = memory.read_u8(at + 1u64)? as u64;

            if length < 2 || offset + length > end {
                warn!("[ACPI] MADT entry at {:#x} has bad length {}", offset, length);
                break;
            }

            match kind {
                entry_type::LOCAL_APIC if length >= 8 => {
                    let processor_id = memory.read_u8(at + 2u64)?;
                    let apic_id = memory.read_u8(at + 3u64)?;
                    let flags = memory.read_u32(at + 4u64)?;
                    if flags & LAPIC_ENABLED != 0 {
                        processors.push(LocalApicInfo {
                            processor_id,
                            apic_id,
                            online_capable: flags & LAPIC_ONLINE_CAPABLE != 0,
                        });
                    } else {
                        debug!("[ACPI] LAPIC {} disabled", apic_id);
                    }
                }
                entry_type::LOCAL_APIC_OVERRIDE if length >= 12 => {
                    local_apic_address = memory.read_u64(at + 4u64)?;
                }
                _ => {}
            }

            offset += length;
        }

        Ok(MadtTopology {
            local_apic_address: PhysAddr::try_new(local_apic_address)
                .map_err(|_| AcpiError::InvalidTable)?,
            has_legacy_pics: flags & 1 != 0,
            processors,
        })
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }
}

impl TopologySource for MadtTopology {
    fn len(&self) -> usize {
        self.processors.len()
    }

    fn controller_id(&self, index: usize) -> u32 {
        self.processors[index].apic_id as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FirmwareImage;

    const RSDP_AT: u64 = 0xE_0000;

    fn local_apic(processor_id: u8, apic_id: u8, flags: u32) -> Vec<u8> {
        let mut entry = vec![entry_type::LOCAL_APIC, 8, processor_id, apic_id];
        entry.extend_from_slice(&flags.to_le_bytes());
        entry
    }

    fn image_with_madt(entries: &[Vec<u8>]) -> FirmwareImage {
        let mut body = Vec::new();
        body.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        for entry in entries {
            body.extend_from_slice(entry);
        }

        let mut image = FirmwareImage::new(0, 0x20_0000);
        image.place_table(0x11_0000, &signature::MADT, &body);
        image.place_table(0x10_0000, &signature::RSDT, &0x11_0000u32.to_le_bytes());
        image.place_rsdp_v1(RSDP_AT, 0x10_0000);
        image
    }

    #[test]
    fn test_enabled_processors_in_order() {
        let image = image_with_madt(&[
            local_apic(0, 0, LAPIC_ENABLED),
            local_apic(1, 2, LAPIC_ENABLED | LAPIC_ONLINE_CAPABLE),
            local_apic(2, 4, 0),
            vec![1, 12, 0, 0, 0, 0, 0xC0, 0xFE, 0, 0, 0, 0],
            local_apic(3, 6, LAPIC_ENABLED),
        ]);
        let acpi = Acpi::init(&image, PhysAddr::new(RSDP_AT));
        let topology = MadtTopology::parse(&acpi).unwrap();

        assert_eq!(topology.local_apic_address, PhysAddr::new(0xFEE0_0000));
        assert!(topology.has_legacy_pics);
        assert_eq!(TopologySource::len(&topology), 3);
        assert_eq!(topology.controller_id(0), 0);
        assert_eq!(topology.controller_id(1), 2);
        assert_eq!(topology.controller_id(2), 6);
        assert!(topology.processors[1].online_capable);
    }

    #[test]
    fn test_local_apic_address_override() {
        let mut entry = vec![entry_type::LOCAL_APIC_OVERRIDE, 12, 0, 0];
        entry.extend_from_slice(&0xFED0_0000u64.to_le_bytes());
        let image = image_with_madt(&[local_apic(0, 0, LAPIC_ENABLED), entry]);

        let acpi = Acpi::init(&image, PhysAddr::new(RSDP_AT));
        let topology = MadtTopology::parse(&acpi).unwrap();
        assert_eq!(topology.local_apic_address, PhysAddr::new(0xFED0_0000));
    }

    #[test]
    fn test_zero_length_entry_stops_walk() {
        let image = image_with_madt(&[
            local_apic(0, 0, LAPIC_ENABLED),
            vec![0, 0, 0, 0],
            local_apic(1, 1, LAPIC_ENABLED),
        ]);
        let acpi = Acpi::init(&image, PhysAddr::new(RSDP_AT));
        assert_eq!(MadtTopology::parse(&acpi).unwrap().processor_count(), 1);
    }

    #[test]
    fn test_missing_madt() {
        let image = FirmwareImage::new(0, 0x1000);
        let acpi = Acpi::init(&image, PhysAddr::new(0));
        assert_eq!(MadtTopology::parse(&acpi), Err(AcpiError::TableNotFound));
    }
}
