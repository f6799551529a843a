//! TFRC 接收方半连接状态
//! TFRC receiver half-connection state
//!
//! 职责：
//! - 测量接收速率并维护RTT估计
//! - 将丢包检测与RTT采样委托给包历史
//! - 根据窗口计数器距离决定何时发送反馈
//!
//! Responsibilities:
//! - Measure the receive rate and keep an RTT estimate
//! - Delegate loss detection and RTT sampling to the packet history
//! - Decide when to send feedback from the window counter distance

use super::{FeedbackReport, LossHistory, PacketHistory, WINDOW_COUNTER_MODULO, ewma, window_counter_delta};
use crate::config::{Config, TfrcConfig};
use crate::connection::ConnectionId;
use crate::error::{Error, Result};
use crate::freeze::receiver::FreezeReceiverState;
use crate::signal::SignalTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Feedback is due once the window counter has moved on by more than this,
/// i.e. roughly one RTT after the last report (RFC 4342 10.3).
const FEEDBACK_COUNTER_DISTANCE: u8 = 3;

/// Weight of the previous packet-size estimate, in tenths.
const PACKET_SIZE_WEIGHT: usize = 9;

/// TFRC 接收方状态
/// TFRC receiver states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    NoDataReceived,
    ReceivingData,
    Terminated,
}

/// 反馈类型
/// Why feedback is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    /// No feedback is due.
    None,
    /// First data packet of the connection.
    Initial,
    /// About one RTT has passed since the last report.
    Periodic,
    /// A new loss event changed the loss event rate.
    ParamChange,
}

/// The receiver half of a TFRC connection.
///
/// TFRC 连接的接收方半连接。
pub struct ReceiverRateState {
    connection: ConnectionId,
    config: TfrcConfig,

    /// Receive rate measured for the last report, bytes/s.
    pub(crate) x_recv: u32,
    bytes_recv: u64,
    /// Window counter at the time of the last report.
    pub(crate) last_counter: u8,
    latest_counter: u8,
    pub(crate) s: usize,
    pub(crate) rtt: Duration,
    tstamp_last_feedback: Instant,
    pub(crate) feedback_kind: FeedbackKind,
    pub(crate) state: ReceiverState,

    pub(crate) packet_history: Box<dyn PacketHistory>,
    pub(crate) loss_history: Box<dyn LossHistory>,

    pub(crate) freeze: FreezeReceiverState,
    pub(crate) signals: Arc<dyn SignalTransport>,
}

impl std::fmt::Debug for ReceiverRateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverRateState")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("x_recv", &self.x_recv)
            .field("bytes_recv", &self.bytes_recv)
            .field("rtt", &self.rtt)
            .field("feedback_kind", &self.feedback_kind)
            .field("freeze", &self.freeze)
            .finish()
    }
}

impl ReceiverRateState {
    /// 创建新的接收方状态
    /// Create a new receiver state
    pub fn new(
        connection: ConnectionId,
        config: &Config,
        packet_history: Box<dyn PacketHistory>,
        loss_history: Box<dyn LossHistory>,
        signals: Arc<dyn SignalTransport>,
        now: Instant,
    ) -> Self {
        Self {
            connection,
            x_recv: 0,
            bytes_recv: 0,
            last_counter: 0,
            latest_counter: 0,
            s: config.tfrc.packet_size,
            rtt: Duration::ZERO,
            tstamp_last_feedback: now,
            feedback_kind: FeedbackKind::None,
            state: ReceiverState::NoDataReceived,
            packet_history,
            loss_history,
            freeze: FreezeReceiverState::new(&config.freeze),
            signals,
            config: config.tfrc.clone(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn x_recv(&self) -> u32 {
        self.x_recv
    }

    /// Payload bytes received since the last report.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_recv
    }

    pub fn last_window_counter(&self) -> u8 {
        self.last_counter
    }

    pub fn packet_size(&self) -> usize {
        self.s
    }

    pub fn last_feedback_timestamp(&self) -> Instant {
        self.tstamp_last_feedback
    }

    /// The pending feedback kind, set by the last arrival.
    pub fn feedback_kind(&self) -> FeedbackKind {
        self.feedback_kind
    }

    pub fn freeze_state(&self) -> &FreezeReceiverState {
        &self.freeze
    }

    /// The receiver's RTT estimate, or the configured fallback before any sample.
    ///
    /// 接收方的RTT估计；在获得样本之前使用配置的后备值。
    pub fn rtt_estimate(&self) -> Duration {
        if self.rtt.is_zero() {
            self.config.fallback_rtt
        } else {
            self.rtt
        }
    }

    /// Processes one data packet and reports whether feedback is due.
    ///
    /// Loss events seen while a freeze episode suspends loss accounting are
    /// not charged to the loss-interval history.
    ///
    /// 处理一个数据包并报告是否需要发送反馈。
    pub fn on_data_received(
        &mut self,
        seqno: u64,
        size: usize,
        window_counter: u8,
        now: Instant,
    ) -> Result<FeedbackKind> {
        if self.state == ReceiverState::Terminated {
            return Err(Error::Terminated);
        }
        let window_counter = window_counter % WINDOW_COUNTER_MODULO;
        let sample = self
            .packet_history
            .record_arrival(seqno, size, now, window_counter)?;

        if let Some(rtt) = sample.rtt_sample.filter(|r| !r.is_zero()) {
            self.rtt = ewma(self.rtt, rtt, self.config.rtt_ewma_weight);
        }
        if size > 0 {
            self.s = (PACKET_SIZE_WEIGHT * self.s + (10 - PACKET_SIZE_WEIGHT) * size) / 10;
        }
        self.bytes_recv += size as u64;
        self.latest_counter = window_counter;

        let kind = if self.state == ReceiverState::NoDataReceived {
            self.state = ReceiverState::ReceivingData;
            debug!(connection = self.connection, "First data packet, sending initial feedback");
            FeedbackKind::Initial
        } else if sample.loss_event && self.freeze.loss_accounting_enabled() {
            self.loss_history.register_loss(seqno, now)?;
            FeedbackKind::ParamChange
        } else {
            if sample.loss_event {
                trace!(
                    connection = self.connection,
                    seqno,
                    mode = %self.freeze.mode(),
                    "Loss during freeze episode not accounted"
                );
            }
            if window_counter_delta(window_counter, self.last_counter) > FEEDBACK_COUNTER_DISTANCE {
                FeedbackKind::Periodic
            } else {
                FeedbackKind::None
            }
        };

        if kind != FeedbackKind::None {
            self.feedback_kind = kind;
        }
        Ok(kind)
    }

    /// Builds the next feedback report and restarts the measurement interval.
    ///
    /// 构建下一个反馈报告并重新开始测量区间。
    pub fn build_feedback(&mut self, now: Instant) -> Result<FeedbackReport> {
        if self.state == ReceiverState::Terminated {
            return Err(Error::Terminated);
        }

        let loss_event_rate = match self.feedback_kind {
            FeedbackKind::Initial => {
                self.x_recv = 0;
                0
            }
            _ => {
                let elapsed = now.saturating_duration_since(self.tstamp_last_feedback);
                if !elapsed.is_zero() {
                    let rate = self.bytes_recv as u128 * 1_000_000 / elapsed.as_micros().max(1);
                    self.x_recv = rate.min(u32::MAX as u128) as u32;
                }
                self.loss_history.current_loss_event_rate()
            }
        };

        let report = FeedbackReport {
            x_recv: self.x_recv,
            loss_event_rate,
            freeze: self.freeze.outbound_indication(),
        };
        trace!(
            connection = self.connection,
            kind = ?self.feedback_kind,
            x_recv = report.x_recv,
            p = report.loss_event_rate,
            "Feedback built"
        );

        self.bytes_recv = 0;
        self.tstamp_last_feedback = now;
        self.last_counter = self.latest_counter;
        self.feedback_kind = FeedbackKind::None;
        Ok(report)
    }

    /// Tears the half-connection down.
    /// 拆除半连接。
    pub fn terminate(&mut self) {
        self.state = ReceiverState::Terminated;
        debug!(connection = self.connection, "Receiver terminated");
    }
}
