//! TCP-Friendly Rate Control (RFC 3448 / RFC 4342, CCID3).
//!
//! TFRC 速率控制（RFC 3448 / RFC 4342，CCID3）。
//!
//! The sender keeps an equation-driven sending rate, the receiver measures
//! the incoming rate and the loss event rate and periodically reports both.
//! The packet-arrival history and the loss-interval database are external
//! collaborators reached through [`PacketHistory`] and [`LossHistory`].

use crate::error::Result;
use crate::packet::FreezeIndication;
use std::time::Duration;
use tokio::time::Instant;

pub mod equation;
pub mod receiver;
pub mod sender;

pub use receiver::{FeedbackKind, ReceiverRateState, ReceiverState};
pub use sender::{SendDecision, SenderRateState, SenderState};


/// Rates are kept in bytes per second scaled by `2^X_SCALE_SHIFT`.
/// 速率以“字节/秒”乘以 `2^X_SCALE_SHIFT` 的形式保存。
pub const X_SCALE_SHIFT: u32 = 6;

/// Loss event rates are fixed point in `0..=P_SCALE`.
/// 丢包事件率是 `0..=P_SCALE` 范围内的定点数。
pub const P_SCALE: u32 = 1_000_000;

/// Window counter values live in `0..16` (RFC 4342 8.1).
pub const WINDOW_COUNTER_MODULO: u8 = 16;

/// A feedback report as sent from the receiver to the sender.
///
/// 接收方发给发送方的反馈报告。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackReport {
    /// Receive rate measured since the last report, bytes per second.
    /// 自上次报告以来测得的接收速率（字节/秒）。
    pub x_recv: u32,
    /// Loss event rate scaled by [`P_SCALE`].
    /// 按 [`P_SCALE`] 缩放的丢包事件率。
    pub loss_event_rate: u32,
    /// The receiver's ongoing freeze indication, if a freeze episode is in progress.
    /// 冻结阶段进行中时接收方的冻结指示。
    pub freeze: Option<FreezeIndication>,
}

/// What the packet history learned from one arrival.
/// 包历史从一次到达中得到的信息。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrivalSample {
    pub rtt_sample: Option<Duration>,
    pub loss_event: bool,
}

/// The packet-arrival history kept by the receiver (loss detection and RTT sampling).
///
/// 接收方维护的包到达历史（丢包检测与RTT采样）。
pub trait PacketHistory: Send + 'static {
    /// Records one data packet and reports any RTT sample or new loss event.
    /// 记录一个数据包并报告RTT样本或新的丢包事件。
    fn record_arrival(
        &mut self,
        seqno: u64,
        size: usize,
        timestamp: Instant,
        window_counter: u8,
    ) -> Result<ArrivalSample>;

    /// Stops producing RTT samples until resumed.
    /// 停止产生RTT样本直到恢复。
    fn pause_rtt_sampling(&mut self) -> Result<()>;

    /// Resumes RTT sampling.
    /// 恢复RTT采样。
    fn resume_rtt_sampling(&mut self) -> Result<()>;
}

/// The loss-interval database (RFC 3448 5.4).
///
/// 丢包间隔数据库（RFC 3448 5.4）。
pub trait LossHistory: Send + 'static {
    /// Starts a new loss interval at `seqno`.
    /// 在 `seqno` 处开始一个新的丢包间隔。
    fn register_loss(&mut self, seqno: u64, timestamp: Instant) -> Result<()>;

    /// The current loss event rate scaled by [`P_SCALE`].
    /// 当前按 [`P_SCALE`] 缩放的丢包事件率。
    fn current_loss_event_rate(&self) -> u32;

    /// Forgets every recorded interval.
    /// 清除所有记录的间隔。
    fn reset(&mut self) -> Result<()>;
}

/// Distance between two window counters, modulo 16.
pub(crate) fn window_counter_delta(later: u8, earlier: u8) -> u8 {
    later.wrapping_sub(earlier) % WINDOW_COUNTER_MODULO
}

/// `bytes / interval` as a scaled rate. A zero interval yields `u64::MAX`.
pub(crate) fn scaled_rate(bytes: usize, interval: Duration) -> u64 {
    let micros = interval.as_micros();
    if micros == 0 {
        return u64::MAX;
    }
    let scaled = ((bytes as u128) << X_SCALE_SHIFT) * 1_000_000 / micros;
    scaled.min(u64::MAX as u128) as u64
}

/// Exponentially weighted moving average of two durations.
pub(crate) fn ewma(avg: Duration, sample: Duration, weight: f64) -> Duration {
    if avg.is_zero() {
        return sample;
    }
    Duration::from_secs_f64(weight * avg.as_secs_f64() + (1.0 - weight) * sample.as_secs_f64())
}
