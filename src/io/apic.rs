// ============================================================================
// src/io/apic.rs - Local APIC / IPI エンコード
// ============================================================================
//!
//! AP起動で使う割り込みコントローラ能力。
//!
//! シーケンサはレジスタへの書き込みのみを行う。`Ipi::encode` がハードウェアの
//! 期待するICRワードを生成し、`send_ipi` はICR high → ICR low の順に書き込む
//! （low への書き込みで送信が始まる）。

use bitflags::bitflags;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::SmpError;

/// Local APIC レジスタオフセット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LapicRegister {
    /// APIC ID
    Id = 0x20,
    /// スプリアス割り込みベクタ
    Spurious = 0xF0,
    /// 割り込みコマンドレジスタ（下位）
    IcrLow = 0x300,
    /// 割り込みコマンドレジスタ（上位）
    IcrHigh = 0x310,
}

impl LapicRegister {
    pub const fn offset(self) -> u32 {
        self as u32
    }
}

bitflags! {
    /// ICR 下位ワードのフィールド
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IcrFlags: u32 {
        /// デリバリモード INIT (0b101)
        const DELIVERY_INIT = 0b101 << 8;
        /// デリバリモード STARTUP (0b110)
        const DELIVERY_STARTUP = 0b110 << 8;
        /// レベルアサート
        const LEVEL_ASSERT = 1 << 14;
    }
}

/// スプリアスベクタレジスタのソフトウェア有効化ビット
const SPURIOUS_APIC_ENABLE: u32 = 1 << 8;

/// STARTUP ベクタ: トランポリンの物理ページ番号（1MiB未満）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupVector(u8);

impl StartupVector {
    /// リアルモードの開始アドレス `vector << 12`
    pub fn entry_address(self) -> PhysAddr {
        PhysAddr::new((self.0 as u64) << 12)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl TryFrom<PhysAddr> for StartupVector {
    type Error = SmpError;

    fn try_from(addr: PhysAddr) -> Result<Self, Self::Error> {
        let addr = addr.as_u64();
        if addr & 0xFFF != 0 || addr >= 0x10_0000 {
            return Err(SmpError::TrampolineNotAddressable);
        }
        Ok(StartupVector((addr >> 12) as u8))
    }
}

/// AP起動中に発行するプロセッサ間割り込み
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    /// INIT: 対象をリセットしSIPI待ちにする
    Init { destination: u32 },
    /// STARTUP: ベクタのページからリアルモード実行を開始
    Startup {
        destination: u32,
        vector: StartupVector,
    },
}

impl Ipi {
    pub fn destination(&self) -> u32 {
        match *self {
            Ipi::Init { destination } | Ipi::Startup { destination, .. } => destination,
        }
    }

    /// `(icr_high, icr_low)` にエンコード
    pub fn encode(&self) -> (u32, u32) {
        let high = self.destination() << 24;
        let low = match *self {
            Ipi::Init { .. } => (IcrFlags::DELIVERY_INIT | IcrFlags::LEVEL_ASSERT).bits(),
            Ipi::Startup { vector, .. } => {
                (IcrFlags::DELIVERY_STARTUP | IcrFlags::LEVEL_ASSERT).bits() | vector.as_u8() as u32
            }
        };
        (high, low)
    }
}

/// ローカル割り込みコントローラへのレジスタ書き込み
pub trait InterruptController {
    fn write(&mut self, register: LapicRegister, value: u32);

    /// 呼び出し元プロセッサのコントローラをソフトウェア有効化
    fn enable(&mut self);
}

impl<C: InterruptController + ?Sized> InterruptController for &mut C {
    fn write(&mut self, register: LapicRegister, value: u32) {
        (**self).write(register, value)
    }

    fn enable(&mut self) {
        (**self).enable()
    }
}

/// IPIを発行: 宛先を先に、次にコマンドワード
pub fn send_ipi<C: InterruptController + ?Sized>(lapic: &mut C, ipi: Ipi) {
    let (high, low) = ipi.encode();
    lapic.write(LapicRegister::IcrHigh, high);
    lapic.write(LapicRegister::IcrLow, low);
}

/// メモリマップドxAPIC
#[derive(Debug, Clone, Copy)]
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// # Safety
    /// `base` はこのプロセッサのLocal APICレジスタページの仮想アドレスで、
    /// キャッシュ無効でマップされていること。
    pub const unsafe fn new(base: VirtAddr) -> Self {
        LocalApic { base }
    }

    fn read(&self, register: LapicRegister) -> u32 {
        let ptr = (self.base + register.offset() as u64).as_ptr::<u32>();
        // SAFETY: レジスタページのマップは `new` の呼び出し側が保証する。
        unsafe { core::ptr::read_volatile(ptr) }
    }

    /// 呼び出し元プロセッサのLocal APIC ID
    pub fn id(&self) -> u32 {
        self.read(LapicRegister::Id) >> 24
    }
}

impl InterruptController for LocalApic {
    fn write(&mut self, register: LapicRegister, value: u32) {
        let ptr = (self.base + register.offset() as u64).as_mut_ptr::<u32>();
        // SAFETY: レジスタページのマップは `new` の呼び出し側が保証する。
        unsafe { core::ptr::write_volatile(ptr, value) }
    }

    fn enable(&mut self) {
        let spurious = self.read(LapicRegister::Spurious);
        self.write(LapicRegister::Spurious, spurious | SPURIOUS_APIC_ENABLE);
    }
}
