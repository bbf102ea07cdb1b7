//! 時間管理モジュール（AP起動ハンドシェイク用）
//!
//! AP起動はスケジューラやタイマー割り込みより前に行われるため、
//! 待機はすべてPITによるビジーウェイト。

use x86_64::instructions::port::Port;

/// PIT (Programmable Interval Timer) 定数
mod pit {
    pub const CHANNEL0_DATA: u16 = 0x40;
    pub const COMMAND: u16 = 0x43;

    /// PIT基本周波数 (Hz)
    pub const BASE_FREQUENCY: u64 = 1193182;

    /// チャンネル0, モード0（カウント終了で割り込み）, lo/hi バイト
    pub const MODE_ONE_SHOT: u8 = 0x30;
    /// リードバック: チャンネル0のステータスをラッチ
    pub const READBACK: u8 = 0xE2;
    /// ステータス bit 7: カウントが0に達するとOUTピンがHigh
    pub const STATUS_OUTPUT: u8 = 0x80;
}

/// ミリ秒単位のブロッキングスリープ
pub trait Sleep {
    fn sleep_ms(&mut self, ms: u64);
}

impl<S: Sleep + ?Sized> Sleep for &mut S {
    fn sleep_ms(&mut self, ms: u64) {
        (**self).sleep_ms(ms)
    }
}

/// 遅延に対応するPITティック数（16ビットカウンタに収める）
fn pit_ticks(microseconds: u64) -> u16 {
    let ticks = (pit::BASE_FREQUENCY * microseconds) / 1_000_000;
    ticks.clamp(1, u16::MAX as u64) as u16
}

/// PITチャンネル0のワンショットモードによるビジーウェイト
pub struct PitSleep {
    command: Port<u8>,
    data: Port<u8>,
}

impl PitSleep {
    /// # Safety
    /// 呼び出し側がPITチャンネル0を占有していること。
    /// 使用中に他のコードがチャンネル0を設定してはならない。
    pub const unsafe fn new() -> Self {
        PitSleep {
            command: Port::new(pit::COMMAND),
            data: Port::new(pit::CHANNEL0_DATA),
        }
    }

    /// 最大約54msのワンショット待機
    pub fn delay_us(&mut self, microseconds: u64) {
        let ticks = pit_ticks(microseconds);

        // SAFETY: チャンネル0の占有は `new` の呼び出し側が保証する。
        unsafe {
            self.command.write(pit::MODE_ONE_SHOT);
            self.data.write((ticks & 0xFF) as u8);
            self.data.write((ticks >> 8) as u8);

            loop {
                self.command.write(pit::READBACK);
                if self.data.read() & pit::STATUS_OUTPUT != 0 {
                    break;
                }
                core::hint::spin_loop();
            }
        }
    }
}

impl Sleep for PitSleep {
    fn sleep_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.delay_us(1000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pit_ticks_per_millisecond() {
        assert_eq!(pit_ticks(1000), 1193);
    }

    #[test]
    fn test_pit_ticks_clamped() {
        assert_eq!(pit_ticks(0), 1);
        assert_eq!(pit_ticks(1_000_000), u16::MAX);
    }
}
