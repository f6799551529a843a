//! TFRC 发送方半连接状态
//! TFRC sender half-connection state
//!
//! 职责：
//! - 根据反馈报告和吞吐量方程维护发送速率
//! - 计算包间发送间隔和窗口计数器
//! - 管理无反馈定时器
//!
//! Responsibilities:
//! - Maintain the sending rate from feedback reports and the throughput equation
//! - Compute the inter-packet interval and the window counter
//! - Manage the no-feedback timer

use super::{X_SCALE_SHIFT, FeedbackReport, equation, ewma, scaled_rate};
use crate::config::{Config, TfrcConfig};
use crate::connection::ConnectionId;
use crate::error::{Error, Result};
use crate::freeze::sender::{FreezeSenderMode, FreezeSenderState};
use crate::signal::SignalTransport;
use crate::timer::{TimerEvent, TimerFacility, TimerHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Largest window counter increment per packet (RFC 4342 8.1).
const MAX_WINDOW_COUNTER_STEP: u8 = 5;

/// TFRC 发送方状态
/// TFRC sender states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// 尚未发送任何包
    /// No packet sent yet
    NoPacketSent,
    /// 已发送但尚未收到反馈
    /// Sending, no feedback received yet
    NoFeedbackYet,
    /// 已收到反馈
    /// Feedback received
    HaveFeedback,
    /// 已终止
    /// Terminated
    Terminated,
}

/// 发送决策
/// Send decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Send now, stamping the packet with this window counter.
    /// 立即发送，并在包上标记此窗口计数器。
    SendNow { window_counter: u8 },
    /// Not before this much time has passed.
    /// 需要再等待这段时间。
    Delay(Duration),
    /// The sender is frozen; nothing may be sent.
    /// 发送方已冻结，不能发送任何内容。
    Hold,
}

/// The sender half of a TFRC connection.
///
/// TFRC 连接的发送方半连接。
pub struct SenderRateState {
    connection: ConnectionId,
    config: TfrcConfig,

    /// Current sending rate, scaled bytes/s.
    pub(crate) x: u64,
    /// Last receive rate reported by the receiver, scaled bytes/s.
    pub(crate) x_recv: u64,
    /// Rate from the throughput equation, bytes/s.
    pub(crate) x_calc: u64,
    /// Smoothed RTT. Zero until the first sample.
    pub(crate) rtt: Duration,
    pub(crate) p: u32,
    pub(crate) s: usize,
    /// Base no-feedback timeout.
    pub(crate) t_rto: Duration,
    pub(crate) t_ipi: Duration,
    delta: Duration,
    pub(crate) has_feedback: bool,
    pub(crate) state: SenderState,

    pub(crate) last_win_count: u8,
    t_last_win_count: Instant,
    /// Time the rate was last doubled during slow start.
    pub(crate) t_ld: Instant,
    /// Nominal send time of the next packet.
    pub(crate) t_nom: Instant,
    /// Current no-feedback timeout including backoff.
    pub(crate) no_feedback_backoff: Duration,

    pub(crate) freeze: FreezeSenderState,

    timer: Arc<dyn TimerFacility>,
    pub(crate) no_feedback_timer: Option<TimerHandle>,
    pub(crate) signals: Arc<dyn SignalTransport>,
}

impl std::fmt::Debug for SenderRateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderRateState")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("rate_x", &self.rate_x())
            .field("rate_x_recv", &self.rate_x_recv())
            .field("p", &self.p)
            .field("rtt", &self.rtt)
            .field("freeze", &self.freeze)
            .finish()
    }
}

impl SenderRateState {
    /// 创建新的发送方状态
    /// Create a new sender state
    pub fn new(
        connection: ConnectionId,
        config: &Config,
        timer: Arc<dyn TimerFacility>,
        signals: Arc<dyn SignalTransport>,
        now: Instant,
    ) -> Self {
        let tfrc = config.tfrc.clone();
        let s = tfrc.packet_size.max(1);
        let mut sender = Self {
            connection,
            x: (s as u64) << X_SCALE_SHIFT,
            x_recv: 0,
            x_calc: 0,
            rtt: Duration::ZERO,
            p: 0,
            s,
            t_rto: tfrc.initial_no_feedback_timeout,
            t_ipi: Duration::from_secs(1),
            delta: Duration::ZERO,
            has_feedback: false,
            state: SenderState::NoPacketSent,
            last_win_count: 0,
            t_last_win_count: now,
            t_ld: now,
            t_nom: now,
            no_feedback_backoff: tfrc.initial_no_feedback_timeout,
            freeze: FreezeSenderState::new(&config.freeze),
            timer,
            no_feedback_timer: None,
            signals,
            config: tfrc,
        };
        sender.update_send_interval();
        sender
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Current sending rate in bytes per second.
    /// 当前发送速率（字节/秒）。
    pub fn rate_x(&self) -> u64 {
        self.x >> X_SCALE_SHIFT
    }

    /// Last receive rate reported by the peer, bytes per second.
    pub fn rate_x_recv(&self) -> u64 {
        self.x_recv >> X_SCALE_SHIFT
    }

    /// Last rate given by the throughput equation, bytes per second.
    pub fn rate_x_calc(&self) -> u64 {
        self.x_calc
    }

    pub fn rtt_estimate(&self) -> Duration {
        self.rtt
    }

    pub fn loss_event_rate(&self) -> u32 {
        self.p
    }

    pub fn packet_size(&self) -> usize {
        self.s
    }

    pub fn has_feedback(&self) -> bool {
        self.has_feedback
    }

    pub fn inter_packet_interval(&self) -> Duration {
        self.t_ipi
    }

    pub fn last_window_counter(&self) -> u8 {
        self.last_win_count
    }

    /// Timestamp of the earliest packet sent with the current window counter.
    pub fn last_window_counter_time(&self) -> Instant {
        self.t_last_win_count
    }

    /// Nominal send time of the next packet.
    pub fn next_send_time(&self) -> Instant {
        self.t_nom
    }

    pub fn last_doubled(&self) -> Instant {
        self.t_ld
    }

    pub fn no_feedback_timeout(&self) -> Duration {
        self.no_feedback_backoff
    }

    pub fn freeze_state(&self) -> &FreezeSenderState {
        &self.freeze
    }

    /// Changes the nominal packet size and recomputes the send interval.
    /// 修改名义包大小并重新计算发送间隔。
    pub fn set_packet_size(&mut self, size: usize) {
        self.s = size.max(1);
        self.update_send_interval();
    }

    /// The inter-packet interval implied by the current rate (RFC 3448 4.6).
    /// Pure; never blocks.
    ///
    /// 当前速率对应的包间间隔（RFC 3448 4.6）。纯函数，从不阻塞。
    pub fn compute_send_interval(&self) -> Duration {
        let x = self.x.max(1) as u128;
        let micros = ((self.s as u128) << X_SCALE_SHIFT) * 1_000_000 / x;
        Duration::from_micros(micros.min(u64::MAX as u128) as u64)
    }

    pub(crate) fn update_send_interval(&mut self) {
        self.t_ipi = self.compute_send_interval();
        self.delta = (self.t_ipi / 2).min(self.config.half_time_granularity);
    }

    /// `s / t_mbi`, the floor below which the rate never drops.
    pub(crate) fn min_rate(&self) -> u64 {
        scaled_rate(self.s, self.config.t_mbi).max(1)
    }

    /// Initial rate of RFC 4342 5: `min(4s, max(2s, 4380)) / R`, or one
    /// packet per second while the RTT is unknown.
    fn initial_rate(&self) -> u64 {
        if self.rtt.is_zero() {
            return (self.s as u64) << X_SCALE_SHIFT;
        }
        let w_init = (4 * self.s).min((2 * self.s).max(4380));
        scaled_rate(w_init, self.rtt)
    }

    /// Decides whether the next packet may leave now (RFC 3448 4.6).
    ///
    /// 判断下一个包现在是否可以发出（RFC 3448 4.6）。
    pub fn send_packet(&mut self, now: Instant) -> Result<SendDecision> {
        if self.state == SenderState::Terminated {
            return Err(Error::Terminated);
        }
        // A frozen sender holds every packet, the first one included.
        if self.freeze.mode() == FreezeSenderMode::Frozen {
            return Ok(SendDecision::Hold);
        }
        match self.state {
            SenderState::NoPacketSent => {
                let timeout = self.config.initial_no_feedback_timeout;
                self.restart_no_feedback_timer(timeout)?;
                self.no_feedback_backoff = timeout;
                self.t_last_win_count = now;
                self.t_ld = now;
                self.x = self.initial_rate();
                self.update_send_interval();
                self.t_nom = now;
                self.state = SenderState::NoFeedbackYet;
                debug!(
                    connection = self.connection,
                    rate = self.rate_x(),
                    "First packet, entering NoFeedbackYet"
                );
            }
            _ => {
                let wait = self.t_nom.saturating_duration_since(now);
                if wait > self.delta {
                    return Ok(SendDecision::Delay(wait));
                }
                self.update_window_counter(now);
            }
        }

        self.t_nom += self.t_ipi;
        Ok(SendDecision::SendNow {
            window_counter: self.last_win_count,
        })
    }

    fn update_window_counter(&mut self, now: Instant) {
        if self.rtt.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.t_last_win_count);
        let quarter_rtts = 4 * elapsed.as_micros() / self.rtt.as_micros().max(1);
        if quarter_rtts > 0 {
            self.t_last_win_count = now;
            let step = quarter_rtts.min(MAX_WINDOW_COUNTER_STEP as u128) as u8;
            self.last_win_count = (self.last_win_count + step) % super::WINDOW_COUNTER_MODULO;
        }
    }

    /// Processes a feedback report from the receiver (RFC 3448 4.3).
    ///
    /// While frozen the report is ignored; while restoring only the RTT
    /// estimate moves. In probing the receive rate is floored at the
    /// pre-freeze snapshot and the report may end the freeze episode.
    ///
    /// 处理来自接收方的反馈报告（RFC 3448 4.3）。
    pub fn on_feedback_received(
        &mut self,
        report: &FeedbackReport,
        rtt_sample: Option<Duration>,
        now: Instant,
    ) -> Result<()> {
        match self.state {
            SenderState::Terminated => return Err(Error::Terminated),
            SenderState::NoPacketSent => {
                trace!(connection = self.connection, "Feedback before first packet, ignored");
                return Ok(());
            }
            _ => {}
        }

        match self.freeze.mode() {
            FreezeSenderMode::Frozen => {
                trace!(connection = self.connection, "Feedback while frozen, ignored");
                return Ok(());
            }
            FreezeSenderMode::Restoring => {
                self.update_rtt(rtt_sample);
                let timeout = self.base_no_feedback_timeout();
                self.no_feedback_backoff = timeout;
                return self.restart_no_feedback_timer(timeout);
            }
            FreezeSenderMode::Normal | FreezeSenderMode::Probing => {}
        }

        self.update_rtt(rtt_sample);
        self.x_recv = (report.x_recv as u64) << X_SCALE_SHIFT;
        if self.freeze.mode() == FreezeSenderMode::Probing {
            self.x_recv = self.x_recv.max(self.freeze.saved_x_recv);
        }
        self.p = report.loss_event_rate;

        if self.state == SenderState::NoFeedbackYet {
            self.state = SenderState::HaveFeedback;
            self.has_feedback = true;
            if self.p == 0 {
                // Slow start has not begun yet: restart it from the initial rate
                // now that R is known, but never below what we already send at.
                self.x = self.x.max(self.initial_rate());
                self.t_ld = now;
                self.update_send_interval();
            } else {
                self.compute_rate(now);
            }
            debug!(
                connection = self.connection,
                rate = self.rate_x(),
                "First feedback, entering HaveFeedback"
            );
        } else {
            self.compute_rate(now);
        }

        let timeout = self.base_no_feedback_timeout();
        self.no_feedback_backoff = timeout;
        self.restart_no_feedback_timer(timeout)?;

        self.finish_probing(report);
        Ok(())
    }

    /// Recomputes `rate_x` (RFC 3448 4.3, step 4) and returns it in bytes/s.
    ///
    /// With `p > 0` the equation rate is used, capped at twice the receive rate
    /// and floored at `s / t_mbi`. With `p == 0` the equation is undefined and
    /// the rate at most doubles once per RTT; an unknown receive rate leaves
    /// the rate where it is.
    ///
    /// 重新计算 `rate_x` 并以字节/秒返回。
    pub fn compute_rate(&mut self, now: Instant) -> u64 {
        let old_x = self.x;
        let rtt = if self.rtt.is_zero() {
            self.config.fallback_rtt
        } else {
            self.rtt
        };

        if self.p > 0 {
            if let Some(x_calc) = equation::throughput(self.s, rtt, self.p) {
                self.x_calc = x_calc;
                let x_calc_scaled = x_calc.saturating_mul(1 << X_SCALE_SHIFT);
                self.x = x_calc_scaled
                    .min(self.x_recv.saturating_mul(2))
                    .max(self.min_rate());
            }
        } else if self.x_recv > 0 && now.saturating_duration_since(self.t_ld) >= rtt {
            self.x = self
                .x
                .saturating_mul(2)
                .min(self.x_recv.saturating_mul(2))
                .max(scaled_rate(self.s, rtt));
            self.t_ld = now;
        }

        if self.x != old_x {
            self.update_send_interval();
            trace!(
                connection = self.connection,
                old = old_x >> X_SCALE_SHIFT,
                new = self.rate_x(),
                p = self.p,
                "Sending rate updated"
            );
        }
        self.rate_x()
    }

    /// Handles expiry of the no-feedback timer (RFC 3448 4.4).
    ///
    /// `handle` identifies the expired timer; a late firing for a timer that
    /// has since been cancelled or replaced, or one that arrives while frozen,
    /// does nothing.
    ///
    /// 处理无反馈定时器到期（RFC 3448 4.4）。
    pub fn on_no_feedback_timeout(&mut self, handle: TimerHandle, now: Instant) -> Result<()> {
        if self.no_feedback_timer != Some(handle) {
            trace!(connection = self.connection, "Stale no-feedback timer, ignored");
            return Ok(());
        }
        self.no_feedback_timer = None;

        if matches!(
            self.state,
            SenderState::Terminated | SenderState::NoPacketSent
        ) || self.freeze.mode() == FreezeSenderMode::Frozen
        {
            trace!(
                connection = self.connection,
                state = ?self.state,
                "No-feedback timer fired with nothing to do"
            );
            return Ok(());
        }

        let floor = self.min_rate();
        self.x = (self.x / 2).max(floor);
        self.x_recv = (self.x_recv / 2).max(floor);
        self.t_ld = now;
        self.update_send_interval();

        self.no_feedback_backoff = (self.no_feedback_backoff * 2).min(self.config.t_mbi);
        debug!(
            connection = self.connection,
            rate = self.rate_x(),
            next_timeout = ?self.no_feedback_backoff,
            "No feedback, halving sending rate"
        );
        self.restart_no_feedback_timer(self.no_feedback_backoff)
    }

    /// `max(4R, min timeout, 2·ipi)` once feedback is flowing.
    pub(crate) fn base_no_feedback_timeout(&self) -> Duration {
        if self.rtt.is_zero() {
            return self.config.initial_no_feedback_timeout;
        }
        self.t_rto.max(self.t_ipi * 2)
    }

    fn update_rtt(&mut self, sample: Option<Duration>) {
        if let Some(sample) = sample.filter(|s| !s.is_zero()) {
            self.rtt = ewma(self.rtt, sample, self.config.rtt_ewma_weight);
            self.t_rto = (self.rtt * 4).max(self.config.min_no_feedback_timeout);
        }
    }

    pub(crate) fn restart_no_feedback_timer(&mut self, timeout: Duration) -> Result<()> {
        self.suspend_no_feedback_timer();
        let handle = self
            .timer
            .schedule(self.connection, timeout, TimerEvent::NoFeedback)?;
        self.no_feedback_timer = Some(handle);
        Ok(())
    }

    pub(crate) fn suspend_no_feedback_timer(&mut self) {
        if let Some(handle) = self.no_feedback_timer.take() {
            self.timer.cancel(handle);
        }
    }

    /// Tears the half-connection down and cancels its timer.
    /// 拆除半连接并取消其定时器。
    pub fn terminate(&mut self) {
        self.suspend_no_feedback_timer();
        self.state = SenderState::Terminated;
        debug!(connection = self.connection, "Sender terminated");
    }
}
