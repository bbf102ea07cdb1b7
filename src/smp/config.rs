//! Bring-up configuration
//!
//! The INIT/STARTUP settle times are the handshake's documented minimums;
//! slower physical or virtualized machines may need them raised.

use x86_64::VirtAddr;

/// Per-CPU kernel stack size (16 KiB)
pub const CPU_STACK_SIZE: u64 = 16 * 1024;

/// Initial stack cursor: kernel physical offset + 0xeffff0
pub const DEFAULT_STACK_TOP: u64 = 0xffff_8000_00ef_fff0;

/// Timing and stack layout for AP bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringupConfig {
    /// Delay after INIT before the first STARTUP (ms)
    pub init_settle_ms: u64,
    /// Delay after the first STARTUP before polling the alive flag (ms)
    pub startup_settle_ms: u64,
    /// Delay after the retried STARTUP before the final poll (ms)
    pub startup_retry_ms: u64,
    /// Delay after a successful start before the next candidate (ms)
    pub post_start_delay_ms: u64,
    /// Size of each processor's kernel stack slice
    pub stack_size: u64,
    /// Top of the first (BSP) stack slice; later slices grow downwards
    pub stack_top: VirtAddr,
}

impl Default for BringupConfig {
    fn default() -> Self {
        BringupConfig {
            init_settle_ms: 10,
            startup_settle_ms: 1,
            startup_retry_ms: 1000,
            post_start_delay_ms: 10,
            stack_size: CPU_STACK_SIZE,
            stack_top: VirtAddr::new(DEFAULT_STACK_TOP),
        }
    }
}

impl BringupConfig {
    pub fn with_init_settle_ms(mut self, ms: u64) -> Self {
        self.init_settle_ms = ms;
        self
    }

    pub fn with_startup_settle_ms(mut self, ms: u64) -> Self {
        self.startup_settle_ms = ms;
        self
    }

    pub fn with_startup_retry_ms(mut self, ms: u64) -> Self {
        self.startup_retry_ms = ms;
        self
    }

    pub fn with_post_start_delay_ms(mut self, ms: u64) -> Self {
        self.post_start_delay_ms = ms;
        self
    }

    pub fn with_stack(mut self, top: VirtAddr, size: u64) -> Self {
        self.stack_top = top;
        self.stack_size = size;
        self
    }

    /// Worst-case time spent on one candidate that never answers (ms)
    pub fn worst_case_per_candidate_ms(&self) -> u64 {
        self.init_settle_ms + self.startup_settle_ms + self.startup_retry_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = BringupConfig::default();
        assert_eq!(config.init_settle_ms, 10);
        assert_eq!(config.startup_settle_ms, 1);
        assert_eq!(config.startup_retry_ms, 1000);
        assert_eq!(config.stack_size, 16384);
        assert_eq!(config.worst_case_per_candidate_ms(), 1011);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BringupConfig::default()
            .with_init_settle_ms(20)
            .with_startup_retry_ms(2000);
        assert_eq!(config.init_settle_ms, 20);
        assert_eq!(config.startup_retry_ms, 2000);
        assert_eq!(config.startup_settle_ms, 1);
    }
}
