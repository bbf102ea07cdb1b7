// ============================================================================
// src/io/acpi/parser.rs - ACPI Locator and SDT Walker
// ============================================================================
//!
//! ACPI テーブルパーサー
//!
//! RSDP検証、RSDT/XSDT選択、シグネチャによるテーブル検索を実装。
//!
//! RSDPが見つからない・壊れている場合もカーネル全体のエラーにはしない。
//! ACPIは利用不可となり、以降の検索はファームウェアメモリを読まずに失敗する。

use alloc::vec::Vec;

use log::{debug, info, warn};
use x86_64::PhysAddr;

use super::tables::*;
use crate::error::AcpiError;
use crate::io::memory::PhysicalMemory;

/// Extended BIOS Data Area segment pointer (real-mode segment at 0x40E)
const EBDA_POINTER: u64 = 0x40E;
/// Bytes of the EBDA searched for the RSDP
const EBDA_SEARCH_LENGTH: u64 = 1024;
/// BIOS read-only area searched for the RSDP
const BIOS_AREA: (u64, u64) = (0xE_0000, 0x10_0000);
/// The RSDP is always 16-byte aligned
const RSDP_ALIGN: u64 = 16;
/// Chunk size used while summing a table in place
const CHECKSUM_CHUNK: usize = 64;

// ============================================================================
// Root table
// ============================================================================

/// The root table selected from the RSDP; exactly one is active per boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootTable {
    /// ACPI 1.0 RSDT, 32-bit entries
    Rsdt(PhysAddr),
    /// ACPI 2.0+ XSDT, 64-bit entries
    Xsdt(PhysAddr),
}

impl RootTable {
    pub fn address(&self) -> PhysAddr {
        match *self {
            RootTable::Rsdt(addr) | RootTable::Xsdt(addr) => addr,
        }
    }

    pub fn entry_size(&self) -> u64 {
        match self {
            RootTable::Rsdt(_) => 4,
            RootTable::Xsdt(_) => 8,
        }
    }

    pub fn signature(&self) -> [u8; 4] {
        match self {
            RootTable::Rsdt(_) => signature::RSDT,
            RootTable::Xsdt(_) => signature::XSDT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tables {
    rsdp: Rsdp,
    root: RootTable,
    entries: usize,
}

// ============================================================================
// Helpers
// ============================================================================

fn read_header<M: PhysicalMemory>(memory: &M, addr: PhysAddr) -> Result<SdtHeader, AcpiError> {
    let mut raw = [0u8; SDT_HEADER_LENGTH];
    memory.read(addr, &mut raw)?;
    Ok(SdtHeader::from_bytes(&raw))
}

/// Sum `length` bytes at `addr` without buffering the whole table
fn region_checksum<M: PhysicalMemory>(
    memory: &M,
    addr: PhysAddr,
    length: usize,
) -> Result<u8, AcpiError> {
    let mut chunk = [0u8; CHECKSUM_CHUNK];
    let mut sum = 0u8;
    let mut offset = 0usize;

    while offset < length {
        let n = (length - offset).min(CHECKSUM_CHUNK);
        let at = PhysAddr::try_new(addr.as_u64() + offset as u64)
            .map_err(|_| AcpiError::UnmappedMemory)?;
        memory.read(at, &mut chunk[..n])?;
        sum = sum.wrapping_add(checksum(&chunk[..n]));
        offset += n;
    }

    Ok(sum)
}

/// Read and fully validate the table at `addr`
fn validate_table<M: PhysicalMemory>(memory: &M, addr: PhysAddr) -> Result<SdtHeader, AcpiError> {
    let header = read_header(memory, addr)?;
    if header.len() < SDT_HEADER_LENGTH {
        return Err(AcpiError::InvalidTable);
    }
    if region_checksum(memory, addr, header.len())? != 0 {
        return Err(AcpiError::InvalidTableChecksum);
    }
    Ok(header)
}

/// Validate the RSDP at `addr` (signature, legacy and extended checksums)
pub fn validate_rsdp<M: PhysicalMemory>(memory: &M, addr: PhysAddr) -> Result<Rsdp, AcpiError> {
    let mut raw = [0u8; RSDP_V2_LENGTH];
    memory.read(addr, &mut raw[..RSDP_V1_LENGTH])?;

    if &raw[..8] != RSDP_SIGNATURE {
        return Err(AcpiError::InvalidSignature);
    }
    if !is_checksum_valid(&raw[..RSDP_V1_LENGTH]) {
        return Err(AcpiError::InvalidRsdpChecksum);
    }

    if raw[15] >= 2 {
        memory.read(addr + RSDP_V1_LENGTH as u64, &mut raw[RSDP_V1_LENGTH..])?;
        let length = u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]) as usize;
        if length < RSDP_V2_LENGTH {
            return Err(AcpiError::InvalidTable);
        }
        if region_checksum(memory, addr, length)? != 0 {
            return Err(AcpiError::InvalidExtendedChecksum);
        }
    }

    Ok(Rsdp::from_bytes(&raw))
}

/// Search the BIOS areas for a valid RSDP
///
/// Looks at the first KiB of the EBDA, then at `0xE0000..0x100000`.
pub fn find_rsdp<M: PhysicalMemory>(memory: &M) -> Result<PhysAddr, AcpiError> {
    let mut regions = [(0u64, 0u64); 2];
    let mut count = 0;

    let mut segment = [0u8; 2];
    if memory.read(PhysAddr::new(EBDA_POINTER), &mut segment).is_ok() {
        let ebda = (u16::from_le_bytes(segment) as u64) << 4;
        if ebda != 0 {
            regions[count] = (ebda, ebda + EBDA_SEARCH_LENGTH);
            count += 1;
        }
    }
    regions[count] = BIOS_AREA;
    count += 1;

    for &(start, end) in &regions[..count] {
        let mut addr = start;
        while addr + RSDP_V1_LENGTH as u64 <= end {
            let candidate = PhysAddr::new(addr);
            if validate_rsdp(memory, candidate).is_ok() {
                debug!("[ACPI] RSDP found at {:#x}", addr);
                return Ok(candidate);
            }
            addr += RSDP_ALIGN;
        }
    }

    Err(AcpiError::RsdpNotFound)
}

// ============================================================================
// ACPI facility
// ============================================================================

/// The validated firmware table index
///
/// Set up once by [`Acpi::init`] and read-only afterwards.
pub struct Acpi<M> {
    memory: M,
    tables: Option<Tables>,
}

impl<M: PhysicalMemory> Acpi<M> {
    /// Validate the RSDP at `rsdp_address` and select the root table.
    ///
    /// Never fails: on any validation error the facility is unavailable.
    pub fn init(memory: M, rsdp_address: PhysAddr) -> Self {
        let tables = match Self::locate(&memory, rsdp_address) {
            Ok(tables) => {
                info!(
                    "[ACPI] Revision {} ({}), {:?} with {} entries",
                    tables.rsdp.revision,
                    tables.rsdp.oem_id_str(),
                    tables.root,
                    tables.entries
                );
                Some(tables)
            }
            Err(e) => {
                warn!("[ACPI] Unavailable: {} (RSDP at {:#x})", e, rsdp_address.as_u64());
                None
            }
        };

        Acpi { memory, tables }
    }

    /// Facility with no tables at all
    pub fn unavailable(memory: M) -> Self {
        Acpi {
            memory,
            tables: None,
        }
    }

    fn locate(memory: &M, rsdp_address: PhysAddr) -> Result<Tables, AcpiError> {
        let rsdp = validate_rsdp(memory, rsdp_address)?;

        let root = if rsdp.is_xsdt_available() {
            RootTable::Xsdt(rsdp.xsdt().ok_or(AcpiError::InvalidTable)?)
        } else {
            RootTable::Rsdt(rsdp.rsdt())
        };

        let header = validate_table(memory, root.address())?;
        if header.signature != root.signature() {
            return Err(AcpiError::InvalidSignature);
        }

        let entries = (header.len() - SDT_HEADER_LENGTH) / root.entry_size() as usize;
        Ok(Tables {
            rsdp,
            root,
            entries,
        })
    }

    /// Whether a valid RSDP and root table were found
    pub fn is_available(&self) -> bool {
        self.tables.is_some()
    }

    pub fn rsdp(&self) -> Option<Rsdp> {
        self.tables.map(|t| t.rsdp)
    }

    pub fn root_table(&self) -> Option<RootTable> {
        self.tables.map(|t| t.root)
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Physical address stored in root table entry `index`
    fn entry(&self, tables: &Tables, index: usize) -> Result<PhysAddr, AcpiError> {
        let root = tables.root;
        let at = root.address() + SDT_HEADER_LENGTH as u64 + index as u64 * root.entry_size();
        let raw = match root {
            RootTable::Rsdt(_) => self.memory.read_u32(at)? as u64,
            RootTable::Xsdt(_) => self.memory.read_u64(at)?,
        };
        PhysAddr::try_new(raw).map_err(|_| AcpiError::InvalidTable)
    }

    /// Valid tables in root table order; invalid entries are skipped
    fn valid_tables<'a>(&'a self) -> impl Iterator<Item = TableRef> + 'a {
        let tables = self.tables;
        let count = tables.map_or(0, |t| t.entries);

        (0..count).filter_map(move |index| {
            let tables = tables.as_ref()?;
            let address = self.entry(tables, index).ok()?;
            match validate_table(&self.memory, address) {
                Ok(header) => Some(TableRef { address, header }),
                Err(e) => {
                    debug!("[ACPI] Skipping entry {} at {:#x}: {}", index, address.as_u64(), e);
                    None
                }
            }
        })
    }

    /// Find the first checksum-valid table whose signature matches exactly
    pub fn find_table(&self, signature: &[u8; 4]) -> Option<TableRef> {
        if !self.is_available() {
            return None;
        }
        self.valid_tables()
            .find(|table| &{ table.header.signature } == signature)
    }

    /// All checksum-valid tables
    pub fn tables(&self) -> Vec<TableRef> {
        self.valid_tables().collect()
    }
}
