//! 統一エラーハンドリングモジュール
//!
//! ACPI / SMP 各サブシステムのエラーを `KernelError` に統一し、
//! `?` でサブシステム間を跨いで伝播できるようにする。

use core::fmt;

/// カーネル全体の統一エラー型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// ACPI関連エラー
    Acpi(AcpiError),
    /// SMP起動関連エラー
    Smp(SmpError),
    /// 一般的なエラー
    General(GeneralError),
}

/// ACPI関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// BIOS領域の走査でRSDPが見つからない
    RsdpNotFound,
    /// 指定シグネチャの有効なテーブルがない
    TableNotFound,
    /// シグネチャ不一致
    InvalidSignature,
    /// RSDP先頭20バイトのチェックサム不正
    InvalidRsdpChecksum,
    /// 拡張RSDP (revision >= 2) のチェックサム不正
    InvalidExtendedChecksum,
    /// テーブル全長のチェックサム不正
    InvalidTableChecksum,
    /// テーブル構造不正（長さ不足など）
    InvalidTable,
    /// ファームウェアメモリの範囲外
    UnmappedMemory,
}

/// SMP起動関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
    /// 2回の起動待ちのどちらでもAPが応答しない
    StartupTimeout,
    /// トランポリンがページ境界にない、または1MiB以上
    TrampolineNotAddressable,
}

/// 一般的なエラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralError {
    /// 一度きりの初期化が2回呼ばれた
    AlreadyInitialized,
}

// ===== Display実装 =====

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Acpi(e) => write!(f, "ACPI error: {}", e),
            KernelError::Smp(e) => write!(f, "SMP error: {}", e),
            KernelError::General(e) => write!(f, "General error: {}", e),
        }
    }
}

impl fmt::Display for AcpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcpiError::RsdpNotFound => write!(f, "RSDP not found"),
            AcpiError::TableNotFound => write!(f, "table not found"),
            AcpiError::InvalidSignature => write!(f, "invalid signature"),
            AcpiError::InvalidRsdpChecksum => write!(f, "invalid RSDP checksum"),
            AcpiError::InvalidExtendedChecksum => write!(f, "invalid extended RSDP checksum"),
            AcpiError::InvalidTableChecksum => write!(f, "invalid table checksum"),
            AcpiError::InvalidTable => write!(f, "invalid table"),
            AcpiError::UnmappedMemory => write!(f, "unmapped firmware memory"),
        }
    }
}

impl fmt::Display for SmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmpError::StartupTimeout => write!(f, "AP startup timeout"),
            SmpError::TrampolineNotAddressable => write!(f, "trampoline not addressable by SIPI"),
        }
    }
}

impl fmt::Display for GeneralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneralError::AlreadyInitialized => write!(f, "already initialized"),
        }
    }
}

// ===== サブエラーからのFrom実装 =====

impl From<AcpiError> for KernelError {
    fn from(e: AcpiError) -> Self {
        KernelError::Acpi(e)
    }
}

impl From<SmpError> for KernelError {
    fn from(e: SmpError) -> Self {
        KernelError::Smp(e)
    }
}

impl From<GeneralError> for KernelError {
    fn from(e: GeneralError) -> Self {
        KernelError::General(e)
    }
}

// ===== Result型エイリアス =====

/// カーネル全体で使用するResult型
pub type KernelResult<T> = Result<T, KernelError>;
