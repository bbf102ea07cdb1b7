// ============================================================================
// src/io/memory.rs - Firmware Memory Access
// ============================================================================
//!
//! ファームウェアメモリ読み出し
//!
//! 物理アドレス指定の読み取り専用アクセスを提供する。
//!
//! ACPI構造体はファームウェアメモリへのポインタキャストではなくバイトコピー
//! からデコードするため、カーネルのダイレクトマップでもテスト用のメモリ
//! イメージでも同じテーブルコードが動く。

use x86_64::{PhysAddr, VirtAddr};

use crate::error::AcpiError;

/// Read access to physical memory holding firmware structures
pub trait PhysicalMemory {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), AcpiError>;

    fn read_u8(&self, addr: PhysAddr) -> Result<u8, AcpiError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&self, addr: PhysAddr) -> Result<u32, AcpiError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: PhysAddr) -> Result<u64, AcpiError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<M: PhysicalMemory + ?Sized> PhysicalMemory for &M {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), AcpiError> {
        (**self).read(addr, buf)
    }
}

/// Physical memory reached through the kernel's direct physical map
pub struct OffsetPhysicalMemory {
    offset: VirtAddr,
    /// Highest physical address (exclusive) covered by the map
    limit: u64,
}

impl OffsetPhysicalMemory {
    /// Create an accessor for a direct map starting at `offset`
    ///
    /// # Safety
    /// Every physical address below `limit` must be mapped readable at
    /// `offset + address` for the lifetime of this accessor.
    pub unsafe fn new(offset: VirtAddr, limit: u64) -> Self {
        OffsetPhysicalMemory { offset, limit }
    }
}

impl PhysicalMemory for OffsetPhysicalMemory {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), AcpiError> {
        let end = addr
            .as_u64()
            .checked_add(buf.len() as u64)
            .ok_or(AcpiError::UnmappedMemory)?;
        if end > self.limit {
            return Err(AcpiError::UnmappedMemory);
        }

        let src = (self.offset + addr.as_u64()).as_ptr::<u8>();
        // SAFETY: the range lies below `limit`, which the constructor's
        // contract guarantees is mapped.
        unsafe {
            core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FirmwareImage;

    #[test]
    fn test_little_endian_helpers() {
        let mut image = FirmwareImage::new(0x1000, 0x100);
        image.write(0x1000, &[0x78, 0x56, 0x34, 0x12, 0xEF, 0xCD, 0xAB, 0x90]);

        assert_eq!(image.read_u8(PhysAddr::new(0x1000)), Ok(0x78));
        assert_eq!(image.read_u32(PhysAddr::new(0x1000)), Ok(0x1234_5678));
        assert_eq!(image.read_u64(PhysAddr::new(0x1000)), Ok(0x90AB_CDEF_1234_5678));
    }

    #[test]
    fn test_out_of_window_read() {
        let image = FirmwareImage::new(0x1000, 0x10);
        let mut buf = [0u8; 4];
        assert_eq!(
            image.read(PhysAddr::new(0x100E), &mut buf),
            Err(AcpiError::UnmappedMemory)
        );
    }

    #[test]
    fn test_offset_memory_reads_through_map() {
        let backing: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let offset = VirtAddr::from_ptr(backing.as_ptr());
        let memory = unsafe { OffsetPhysicalMemory::new(offset, backing.len() as u64) };

        assert_eq!(memory.read_u32(PhysAddr::new(4)), Ok(0x0807_0605));
        let mut buf = [0u8; 2];
        assert_eq!(
            memory.read(PhysAddr::new(7), &mut buf),
            Err(AcpiError::UnmappedMemory)
        );
    }
}
