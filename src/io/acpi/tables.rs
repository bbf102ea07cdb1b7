// ============================================================================
// src/io/acpi/tables.rs - ACPI Table Structures
// ============================================================================
//!
//! ACPI テーブル構造体定義
//!
//! RSDP と SDT 共通ヘッダのレイアウトを定義。
//!
//! `repr(C, packed)` 構造体のサイズはコンパイル時に検査する。
//! 値は常にリトルエンディアンのバイト列からフィールド単位でデコードする。

use core::mem::size_of;
use core::str;

use x86_64::PhysAddr;

// ============================================================================
// Constants and Signatures
// ============================================================================

/// RSDP signature "RSD PTR "
pub const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// Bytes covered by the legacy (revision 0) RSDP checksum
pub const RSDP_V1_LENGTH: usize = 20;

/// Size of the revision >= 2 RSDP
pub const RSDP_V2_LENGTH: usize = 36;

/// Size of the common SDT header
pub const SDT_HEADER_LENGTH: usize = 36;

/// ACPI table signatures
pub mod signature {
    pub const RSDT: [u8; 4] = *b"RSDT";
    pub const XSDT: [u8; 4] = *b"XSDT";
    pub const MADT: [u8; 4] = *b"APIC";
    pub const FADT: [u8; 4] = *b"FACP";
    pub const MCFG: [u8; 4] = *b"MCFG";
    pub const HPET: [u8; 4] = *b"HPET";
}

// ============================================================================
// Checksum
// ============================================================================

/// Byte sum modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// ACPI structures are valid when all their bytes sum to zero
pub fn is_checksum_valid(bytes: &[u8]) -> bool {
    checksum(bytes) == 0
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut raw = [0u8; N];
    raw.copy_from_slice(&bytes[offset..offset + N]);
    raw
}

// ============================================================================
// RSDP - Root System Description Pointer
// ============================================================================

/// Root System Description Pointer (RSDP) structure
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rsdp {
    /// "RSD PTR " signature
    pub signature: [u8; 8],
    /// Checksum for first 20 bytes
    pub checksum: u8,
    /// OEM ID
    pub oem_id: [u8; 6],
    /// Revision (0 = ACPI 1.0, 2 = ACPI 2.0+)
    pub revision: u8,
    /// Physical address of RSDT
    pub rsdt_address: u32,
    // Extended fields (ACPI 2.0+)
    /// Length of entire RSDP structure
    pub length: u32,
    /// Physical address of XSDT
    pub xsdt_address: u64,
    /// Extended checksum
    pub extended_checksum: u8,
    /// Reserved
    pub reserved: [u8; 3],
}

const _: () = assert!(size_of::<Rsdp>() == RSDP_V2_LENGTH);

impl Rsdp {
    /// Decode from the raw 36-byte image. For revision 0 tables the
    /// extended fields are zeroed regardless of what follows in memory.
    pub fn from_bytes(bytes: &[u8; RSDP_V2_LENGTH]) -> Self {
        let revision = bytes[15];
        let extended = revision >= 2;
        Rsdp {
            signature: array(bytes, 0),
            checksum: bytes[8],
            oem_id: array(bytes, 9),
            revision,
            rsdt_address: le_u32(bytes, 16),
            length: if extended { le_u32(bytes, 20) } else { 0 },
            xsdt_address: if extended { le_u64(bytes, 24) } else { 0 },
            extended_checksum: if extended { bytes[32] } else { 0 },
            reserved: if extended { array(bytes, 33) } else { [0; 3] },
        }
    }

    pub fn has_valid_signature(&self) -> bool {
        &{ self.signature } == RSDP_SIGNATURE
    }

    /// Check if ACPI 2.0 or later
    pub fn is_extended(&self) -> bool {
        self.revision >= 2
    }

    /// Check if the XSDT should be used
    pub fn is_xsdt_available(&self) -> bool {
        self.is_extended() && self.xsdt_address != 0
    }

    pub fn rsdt(&self) -> PhysAddr {
        PhysAddr::new(self.rsdt_address as u64)
    }

    /// `None` when the firmware stored an address wider than 52 bits
    pub fn xsdt(&self) -> Option<PhysAddr> {
        PhysAddr::try_new(self.xsdt_address).ok()
    }

    pub fn oem_id_str(&self) -> &str {
        let oem_id = &self.oem_id;
        str::from_utf8(oem_id).unwrap_or("??????")
    }
}

// ============================================================================
// SDT Header - System Description Table Header
// ============================================================================

/// ACPI System Description Table Header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdtHeader {
    /// Table signature
    pub signature: [u8; 4],
    /// Length of entire table
    pub length: u32,
    /// Revision
    pub revision: u8,
    /// Checksum (all bytes must sum to 0)
    pub checksum: u8,
    /// OEM ID
    pub oem_id: [u8; 6],
    /// OEM table ID
    pub oem_table_id: [u8; 8],
    /// OEM revision
    pub oem_revision: u32,
    /// Creator ID
    pub creator_id: u32,
    /// Creator revision
    pub creator_revision: u32,
}

const _: () = assert!(size_of::<SdtHeader>() == SDT_HEADER_LENGTH);

impl SdtHeader {
    pub fn from_bytes(bytes: &[u8; SDT_HEADER_LENGTH]) -> Self {
        SdtHeader {
            signature: array(bytes, 0),
            length: le_u32(bytes, 4),
            revision: bytes[8],
            checksum: bytes[9],
            oem_id: array(bytes, 10),
            oem_table_id: array(bytes, 16),
            oem_revision: le_u32(bytes, 24),
            creator_id: le_u32(bytes, 28),
            creator_revision: le_u32(bytes, 32),
        }
    }

    /// Get signature as string
    pub fn signature_str(&self) -> &str {
        let signature = &self.signature;
        str::from_utf8(signature).unwrap_or("????")
    }

    /// Declared length in bytes
    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= SDT_HEADER_LENGTH
    }
}

/// A validated table found by the walker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    /// Physical address of the header
    pub address: PhysAddr,
    /// Decoded header
    pub header: SdtHeader,
}

impl TableRef {
    /// Physical address of the first byte after the header
    pub fn body(&self) -> PhysAddr {
        self.address + SDT_HEADER_LENGTH as u64
    }

    /// Physical address one past the last byte of the table
    pub fn end(&self) -> PhysAddr {
        self.address + self.header.length as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rejects_nonzero_sum() {
        let mut bytes = [0x12u8, 0x34, 0x56, 0x00];
        assert!(!is_checksum_valid(&bytes));

        // Fix the last byte so the total wraps to zero
        bytes[3] = 0u8.wrapping_sub(checksum(&bytes[..3]));
        assert!(is_checksum_valid(&bytes));
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert!(is_checksum_valid(&[]));
    }

    #[test]
    fn test_rsdp_decode_v1_ignores_extended_bytes() {
        let mut raw = [0xAAu8; RSDP_V2_LENGTH];
        raw[..8].copy_from_slice(RSDP_SIGNATURE);
        raw[9..15].copy_from_slice(b"BOCHS ");
        raw[15] = 0;
        raw[16..20].copy_from_slice(&0x000E_0000u32.to_le_bytes());

        let rsdp = Rsdp::from_bytes(&raw);
        assert!(rsdp.has_valid_signature());
        assert!(!rsdp.is_extended());
        assert!(!rsdp.is_xsdt_available());
        assert_eq!(rsdp.rsdt(), PhysAddr::new(0xE_0000));
        assert_eq!(rsdp.oem_id_str(), "BOCHS ");
        assert_eq!({ rsdp.xsdt_address }, 0);
    }

    #[test]
    fn test_rsdp_decode_v2_fields() {
        let mut raw = [0u8; RSDP_V2_LENGTH];
        raw[..8].copy_from_slice(RSDP_SIGNATURE);
        raw[15] = 2;
        raw[20..24].copy_from_slice(&36u32.to_le_bytes());
        raw[24..32].copy_from_slice(&0x1_2345_6000u64.to_le_bytes());
        raw[32] = 0x5A;

        let rsdp = Rsdp::from_bytes(&raw);
        assert!(rsdp.is_xsdt_available());
        assert_eq!({ rsdp.length }, 36);
        assert_eq!(rsdp.xsdt(), Some(PhysAddr::new(0x1_2345_6000)));
        assert_eq!({ rsdp.extended_checksum }, 0x5A);
    }

    #[test]
    fn test_sdt_header_decode() {
        let mut raw = [0u8; SDT_HEADER_LENGTH];
        raw[..4].copy_from_slice(&signature::MADT);
        raw[4..8].copy_from_slice(&0x2Cu32.to_le_bytes());
        raw[8] = 3;
        raw[16..24].copy_from_slice(b"BXPCAPIC");
        raw[28..32].copy_from_slice(&u32::from_le_bytes(*b"BXPC").to_le_bytes());

        let header = SdtHeader::from_bytes(&raw);
        assert_eq!(header.signature_str(), "APIC");
        assert_eq!(header.len(), 0x2C);
        assert_eq!(header.revision, 3);
        assert_eq!(&{ header.oem_table_id }, b"BXPCAPIC");
        assert_eq!({ header.creator_id }.to_le_bytes(), *b"BXPC");
    }
}
