// ============================================================================
// src/panic_handler.rs - Fatal Escalation and Kernel Panic Path
// ============================================================================
//!
//! 回復不能なエラーの一方向エスカレーション。
//!
//! [`escalate`] は記録とログ出力の後 `panic!` で発散し、カーネル側の
//! `#[panic_handler]` が [`handle_panic`] を呼んで呼び出し元のCPUを停止する。
//! ホスト上のテストでは同じ経路が通常のパニックとして観測できる。

use alloc::format;
use alloc::string::String;
use core::fmt::Debug;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};
use log::error;
use spin::Mutex;

/// 致命的エラーの記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalRecord {
    /// エラーメッセージ
    pub message: &'static str,
    /// 診断値（例: 超過したCPU数）
    pub diagnostic: u64,
    /// 付随するコンテキストの `Debug` 表現
    pub context: Option<String>,
}

/// 統計
static FATAL_COUNT: AtomicU64 = AtomicU64::new(0);
static LAST_FATAL: Mutex<Option<FatalRecord>> = Mutex::new(None);
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// 致命的エラーをエスカレーションする（戻らない）
///
/// 続行するとカーネル状態を破壊しうる場合にのみ使う。
/// AP 1台の起動失敗のような個別の失敗には使わない。
pub fn escalate(message: &'static str, diagnostic: u64, context: Option<&dyn Debug>) -> ! {
    FATAL_COUNT.fetch_add(1, Ordering::Relaxed);

    let context = context.map(|ctx| format!("{:?}", ctx));
    match &context {
        Some(ctx) => error!("[FATAL] {} ({}) {}", message, diagnostic, ctx),
        None => error!("[FATAL] {} ({})", message, diagnostic),
    }

    *LAST_FATAL.lock() = Some(FatalRecord {
        message,
        diagnostic,
        context,
    });

    panic!("{} ({})", message, diagnostic)
}

/// パニックハンドラの本体
///
/// カーネルの `#[panic_handler]` から呼び出す。
pub fn handle_panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    crate::io::log::enter_panic_mode();

    let count = PANIC_COUNT.fetch_add(1, Ordering::Relaxed);

    crate::io::log::early_print("\n");
    crate::io::log::early_print(
        "================================================================================\n",
    );
    crate::io::log::early_print("                            !!! KERNEL PANIC !!!\n");
    crate::io::log::early_print(
        "================================================================================\n",
    );
    error!("Panic #{}", count + 1);
    if let Some(loc) = info.location() {
        error!("Location: {}:{}:{}", loc.file(), loc.line(), loc.column());
    }
    error!("Message: {}", info.message());

    halt()
}

/// 割り込みを無効化してCPUを停止し続ける
pub fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// 統計
#[derive(Debug, Clone)]
pub struct FatalStats {
    pub total_fatal: u64,
    pub total_panics: u64,
    pub last_fatal: Option<FatalRecord>,
}

/// 致命的エラー統計を取得
pub fn fatal_stats() -> FatalStats {
    FatalStats {
        total_fatal: FATAL_COUNT.load(Ordering::Relaxed),
        total_panics: PANIC_COUNT.load(Ordering::Relaxed),
        last_fatal: LAST_FATAL.lock().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    #[should_panic(expected = "smp: CPU limit exceeded (64)")]
    fn test_escalate_never_returns() {
        escalate("smp: CPU limit exceeded", 64, None);
    }

    #[test]
    fn test_escalate_records_event() {
        let before = fatal_stats().total_fatal;
        let context = (3u32, "lapic");

        let result = catch_unwind(AssertUnwindSafe(|| {
            escalate("registry overflow", 7, Some(&context));
        }));

        assert!(result.is_err());
        let stats = fatal_stats();
        assert!(stats.total_fatal > before);
        // Other tests may escalate concurrently; only check when the record is ours
        if let Some(record) = stats.last_fatal.filter(|r| r.message == "registry overflow") {
            assert_eq!(record.diagnostic, 7);
            assert_eq!(record.context.as_deref(), Some("(3, \"lapic\")"));
        }
    }
}
