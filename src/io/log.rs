// ============================================================================
// src/io/log.rs - Kernel Logging System using the `log` crate
// ============================================================================
//!
//! カーネル用ロギングシステム。
//!
//! ## 機能
//! - `log`クレートを使用した標準的なログインターフェース
//! - ヒープ不要の直接シリアル出力 (COM1)
//! - コンパイル時のログレベルフィルタリング (`verbose_logging` feature)
//! - マルチコア安全なSpinlock保護（パニック時はロックを迂回）
//!
//! レコードの整形は [`format_record`] に分離しており、ハードウェアなしで
//! テストできる。

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;
use x86_64::instructions::port::Port;

// ============================================================================
// 定数定義
// ============================================================================

/// シリアルポートベースアドレス (COM1)
const SERIAL_PORT_BASE: u16 = 0x3F8;

/// シリアルデータレジスタオフセット
const SERIAL_DATA_OFFSET: u16 = 0;

/// シリアルラインステータスレジスタオフセット
const SERIAL_LSR_OFFSET: u16 = 5;

/// 送信バッファ空きビット (LSR bit 5)
const LSR_TX_EMPTY: u8 = 0x20;

/// 送信待機タイムアウト（ループ回数、CPU周波数依存）
const TX_TIMEOUT_LOOPS: u32 = 100_000;

// ============================================================================
// ログレベル定義
// ============================================================================

/// コンパイル時のログレベル（featureで変更可能）
#[cfg(feature = "verbose_logging")]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "verbose_logging"))]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// ============================================================================
// ロガー状態管理
// ============================================================================

/// 現在のログレベル（実行時変更可能）
static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

/// シリアルポート排他制御用Spinlock
///
/// AP起動後は複数コアから同時に出力されうる。
/// パニック中はデッドロック回避のためロックを取らない。
static SERIAL_LOCK: Mutex<()> = Mutex::new(());

/// パニック中フラグ（デッドロック回避用）
static IN_PANIC: AtomicBool = AtomicBool::new(false);

/// シリアルポートが初期化済みかどうか
static SERIAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

// ============================================================================
// シリアルポート初期化
// ============================================================================

/// シリアルポートを初期化（COM1, 115200 baud, 8N1）
///
/// 既に初期化済みの場合は何もしない。
pub fn init_serial() {
    if SERIAL_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    // SAFETY: COM1 はカーネルのログ出力専用。
    unsafe {
        let base = SERIAL_PORT_BASE;

        let mut ier: Port<u8> = Port::new(base + 1);
        let mut lcr: Port<u8> = Port::new(base + 3);
        let mut dll: Port<u8> = Port::new(base);
        let mut dlh: Port<u8> = Port::new(base + 1);
        let mut fcr: Port<u8> = Port::new(base + 2);
        let mut mcr: Port<u8> = Port::new(base + 4);

        // 割り込み無効化
        ier.write(0x00);

        // DLAB有効化、ボーレート 115200 (divisor = 1)
        lcr.write(0x80);
        dll.write(0x01);
        dlh.write(0x00);

        // 8N1
        lcr.write(0x03);

        // FIFO有効化、バッファクリア、14バイトスレッショルド
        fcr.write(0xC7);

        // ループバックテスト
        mcr.write(0x1E);
        let mut data: Port<u8> = Port::new(base);
        data.write(0xAE);
        if data.read() != 0xAE {
            SERIAL_INITIALIZED.store(false, Ordering::SeqCst);
            return;
        }

        // 通常モード: DTR, RTS, OUT1, OUT2
        mcr.write(0x0F);
    }
}

// ============================================================================
// レコード整形
// ============================================================================

/// ログレベルのプレフィックス
fn level_prefix(level: Level) -> &'static str {
    match level {
        Level::Error => "[ERROR] ",
        Level::Warn => "[WARN]  ",
        Level::Info => "[INFO]  ",
        Level::Debug => "[DEBUG] ",
        Level::Trace => "[TRACE] ",
    }
}

/// LF を CRLF に変換して書き込むアダプタ（ターミナル互換性）
pub struct CrlfWriter<W> {
    inner: W,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        CrlfWriter { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut lines = s.split('\n');
        if let Some(first) = lines.next() {
            self.inner.write_str(first)?;
        }
        for line in lines {
            self.inner.write_str("\r\n")?;
            self.inner.write_str(line)?;
        }
        Ok(())
    }
}

/// 1レコードを `[LEVEL] [module] message\r\n` 形式で書き込む
pub fn format_record<W: Write>(
    out: &mut W,
    level: Level,
    module: Option<&str>,
    args: fmt::Arguments<'_>,
) -> fmt::Result {
    let mut out = CrlfWriter::new(out);
    out.write_str(level_prefix(level))?;
    if let Some(module) = module {
        write!(out, "[{}] ", module)?;
    }
    out.write_fmt(args)?;
    out.write_str("\n")
}

// ============================================================================
// シリアルロガー実装
// ============================================================================

/// シリアルポートへの生出力（ロックなし）
struct SerialWriter;

impl SerialWriter {
    /// 送信バッファが空になるまで待機してから1バイト書き込む。
    /// タイムアウト時は書き込みをスキップする。
    #[inline]
    fn write_byte(byte: u8) {
        // SAFETY: COM1 のステータス/データレジスタへのアクセスのみ。
        unsafe {
            let mut status_port: Port<u8> = Port::new(SERIAL_PORT_BASE + SERIAL_LSR_OFFSET);
            let mut data_port: Port<u8> = Port::new(SERIAL_PORT_BASE + SERIAL_DATA_OFFSET);

            let mut timeout = TX_TIMEOUT_LOOPS;
            while (status_port.read() & LSR_TX_EMPTY) == 0 && timeout > 0 {
                core::hint::spin_loop();
                timeout -= 1;
            }

            if timeout > 0 {
                data_port.write(byte);
            }
        }
    }
}

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(Self::write_byte);
        Ok(())
    }
}

/// カーネル用シリアルロガー
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= current_log_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // パニック中でなければロックを取得
        let _guard = if IN_PANIC.load(Ordering::Relaxed) {
            None
        } else {
            Some(SERIAL_LOCK.lock())
        };

        let _ = format_record(
            &mut SerialWriter,
            record.level(),
            record.module_path(),
            *record.args(),
        );
    }

    fn flush(&self) {}
}

/// グローバルロガーインスタンス
static LOGGER: KernelLogger = KernelLogger;

// ============================================================================
// 公開API
// ============================================================================

/// ロギングシステムを初期化
///
/// カーネル起動の早い段階で呼び出す。ヒープ初期化前でも動作する。
pub fn init() -> Result<(), SetLoggerError> {
    init_serial();
    log::set_logger(&LOGGER)?;
    log::set_max_level(MAX_LOG_LEVEL);
    CURRENT_LOG_LEVEL.store(MAX_LOG_LEVEL as u8, Ordering::SeqCst);
    Ok(())
}

/// パニック状態を設定（デッドロック回避用）
///
/// 以降、ロガーはロックを取得せずに直接出力する。
pub fn enter_panic_mode() {
    IN_PANIC.store(true, Ordering::SeqCst);
}

/// 実行時にログレベルを変更
pub fn set_log_level(level: LevelFilter) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    log::set_max_level(level);
}

/// 現在のログレベルを取得
pub fn current_log_level() -> LevelFilter {
    LevelFilter::iter()
        .nth(CURRENT_LOG_LEVEL.load(Ordering::Relaxed) as usize)
        .unwrap_or(LevelFilter::Info)
}

/// ロックなしの直接シリアル出力（パニック時用）
pub fn early_print(s: &str) {
    let _ = CrlfWriter::new(SerialWriter).write_str(s);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    fn render(level: Level, module: Option<&str>, args: fmt::Arguments<'_>) -> String {
        let mut out = String::new();
        format_record(&mut out, level, module, args).unwrap();
        out
    }

    #[test]
    fn test_record_layout() {
        let line = render(
            Level::Info,
            Some("rany_smp::smp"),
            format_args!("[SMP] Total CPUs: {}", 4),
        );
        assert_eq!(line, "[INFO]  [rany_smp::smp] [SMP] Total CPUs: 4\r\n");
    }

    #[test]
    fn test_record_without_module() {
        let line = render(Level::Error, None, format_args!("halt"));
        assert_eq!(line, "[ERROR] halt\r\n");
    }

    #[test]
    fn test_embedded_newlines_become_crlf() {
        let line = render(Level::Warn, None, format_args!("a\nb"));
        assert_eq!(line, "[WARN]  a\r\nb\r\n");
    }

    #[test]
    fn test_runtime_level_roundtrip() {
        set_log_level(LevelFilter::Debug);
        assert_eq!(current_log_level(), LevelFilter::Debug);
        set_log_level(LevelFilter::Info);
        assert_eq!(current_log_level(), LevelFilter::Info);
    }
}
