//! 定义了单个 TFRC 连接。
//! Defines a single TFRC connection.
//!
//! A [`Connection`] pairs the sender half and the receiver half of one
//! connection and routes inbound feedback, freeze signals, data and timer
//! expirations to them. The host transport owns the connection and calls into
//! it from one task at a time.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::freeze::{DispatchOutcome, OptionContext, Transition, seq_after, dispatch_freeze_state};
use crate::freeze::{FreezeReceiverMode, FreezeSenderMode};
use crate::packet::{FreezeIndication, TfrcOption};
use crate::signal::{Signal, SignalKind, SignalTransport};
use crate::tfrc::{
    FeedbackKind, FeedbackReport, LossHistory, PacketHistory, ReceiverRateState, SendDecision,
    SenderRateState,
};
use crate::timer::{TimerEvent, TimerEventData, TimerFacility};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Connection identifier used in logs, timer events and signals.
pub type ConnectionId = u32;

/// The collaborators a connection is built from.
///
/// 构建连接所需的协作者。
pub struct Collaborators {
    pub timer: Arc<dyn TimerFacility>,
    pub signals: Arc<dyn SignalTransport>,
    pub packet_history: Box<dyn PacketHistory>,
    pub loss_history: Box<dyn LossHistory>,
}

/// Both halves of one TFRC connection.
///
/// 一个 TFRC 连接的两个半连接。
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    sender: SenderRateState,
    receiver: ReceiverRateState,
    /// Next sequence number for locally originated freeze requests.
    freeze_seqno: u64,
    signal_packets_remaining: u32,
    signal_packets: u32,
}

impl Connection {
    pub fn new(id: ConnectionId, config: &Config, collaborators: Collaborators, now: Instant) -> Self {
        let Collaborators {
            timer,
            signals,
            packet_history,
            loss_history,
        } = collaborators;
        Self {
            id,
            sender: SenderRateState::new(id, config, timer, signals.clone(), now),
            receiver: ReceiverRateState::new(id, config, packet_history, loss_history, signals, now),
            freeze_seqno: 1,
            signal_packets_remaining: 0,
            signal_packets: config.freeze.signal_packets,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sender(&self) -> &SenderRateState {
        &self.sender
    }

    pub fn sender_mut(&mut self) -> &mut SenderRateState {
        &mut self.sender
    }

    pub fn receiver(&self) -> &ReceiverRateState {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut ReceiverRateState {
        &mut self.receiver
    }

    /// Allocates a sequence number newer than anything either half has seen.
    ///
    /// 分配一个比两个半连接见过的任何序列号都新的序列号。
    pub fn next_freeze_seqno(&mut self) -> u64 {
        let mut seqno = self.freeze_seqno;
        let receiver_next = self.receiver.freeze_state().next_seqno();
        if seq_after(receiver_next, seqno) {
            seqno = receiver_next;
        }
        if let Some(epoch) = self.sender.freeze_state().epoch() {
            if !seq_after(seqno, epoch) {
                seqno = epoch + 1;
            }
        }
        seqno &= (1 << crate::freeze::SEQNO_BITS) - 1;
        self.freeze_seqno = seqno + 1;
        seqno
    }

    /// Local request to freeze (`value == 1`) or unfreeze (`value == 0`) the
    /// connection. On a receiver-side change the request is repeated on the
    /// next few outgoing packets.
    ///
    /// 本地请求冻结或解冻连接。
    pub fn dispatch_freeze_state(
        &mut self,
        receiver_only: bool,
        value: u32,
        now: Instant,
    ) -> DispatchOutcome {
        let ctx = OptionContext {
            seqno: self.next_freeze_seqno(),
            now,
        };
        let outcome =
            dispatch_freeze_state(&mut self.receiver, &mut self.sender, receiver_only, value, ctx);
        if outcome.receiver_changed() {
            self.signal_packets_remaining = self.signal_packets;
        }
        outcome
    }

    /// The receiver's pending freeze request to piggyback on the next outgoing
    /// packet, while repetitions remain.
    ///
    /// 在仍有重复次数时，返回需要附加在下一个出站包上的冻结请求。
    pub fn take_signal_repetition(&mut self) -> Option<TfrcOption> {
        if self.signal_packets_remaining == 0 {
            return None;
        }
        let indication = self.receiver.freeze_state().outbound_indication().filter(|i| {
            matches!(i.kind, SignalKind::Freeze | SignalKind::Unfreeze)
        });
        match indication {
            Some(indication) => {
                self.signal_packets_remaining -= 1;
                Some(TfrcOption::Freeze(indication))
            }
            None => {
                self.signal_packets_remaining = 0;
                None
            }
        }
    }

    /// Routes one inbound freeze signal to the half it is addressed to.
    ///
    /// Signals the sender half has already moved past are dropped quietly. A
    /// signal that is unexpected in the current state is logged and reported
    /// as `Err(UnexpectedState)`.
    ///
    /// 将一个入站冻结信号路由到对应的半连接。
    pub fn on_signal(&mut self, kind: SignalKind, seqno: u64, now: Instant) -> Result<Transition> {
        trace!(connection = self.id, %kind, seqno, "Freeze signal received");
        match kind {
            SignalKind::Freeze | SignalKind::Unfreeze | SignalKind::Unfrozen
                if self.sender_finished_with(seqno) =>
            {
                Ok(Transition::Duplicate)
            }
            SignalKind::Freeze => self.sender.freeze(seqno),
            SignalKind::Unfreeze => self.sender.unfreeze(seqno, now),
            SignalKind::Unfrozen => self.sender.receiver_unfrozen(seqno),
            SignalKind::Restoring => self.receiver.on_sender_restoring(seqno, now),
            SignalKind::Probing => self.receiver.on_sender_probing(seqno),
        }
    }

    /// An indication from an episode the sender has already completed.
    fn sender_finished_with(&self, seqno: u64) -> bool {
        let freeze = self.sender.freeze_state();
        freeze.mode() == FreezeSenderMode::Normal
            && freeze.epoch().is_some_and(|epoch| !seq_after(seqno, epoch))
    }

    /// Processes a feedback report from the peer receiver, including the freeze
    /// indication it may carry.
    ///
    /// 处理来自对端接收方的反馈报告，包括其中可能携带的冻结指示。
    pub fn on_feedback(
        &mut self,
        report: &FeedbackReport,
        rtt_sample: Option<Duration>,
        now: Instant,
    ) -> Result<()> {
        if let Some(FreezeIndication { kind, seqno }) = report.freeze {
            match self.on_signal(kind, seqno, now) {
                Ok(_) => {}
                Err(Error::UnexpectedState { .. }) => {
                    debug!(connection = self.id, %kind, seqno, "Feedback indication ignored");
                }
                Err(error) => return Err(error),
            }
        }
        self.sender.on_feedback_received(report, rtt_sample, now)
    }

    /// Decodes a feedback packet's options and processes the report.
    pub fn on_feedback_options(
        &mut self,
        options: &[u8],
        rtt_sample: Option<Duration>,
        now: Instant,
    ) -> Result<()> {
        let report = FeedbackReport::decode(&mut &options[..])?;
        self.on_feedback(&report, rtt_sample, now)
    }

    /// Processes one inbound data packet and polls the restoration deadline.
    ///
    /// 处理一个入站数据包并轮询恢复期截止时间。
    pub fn on_data(
        &mut self,
        seqno: u64,
        size: usize,
        window_counter: u8,
        now: Instant,
    ) -> Result<FeedbackKind> {
        let kind = self.receiver.on_data_received(seqno, size, window_counter, now)?;
        self.poll(now)?;
        Ok(kind)
    }

    /// Polls the receiver's restoration deadline. Returns `true` when the
    /// restoration phase has just ended.
    pub fn poll(&mut self, now: Instant) -> Result<bool> {
        self.receiver.check_restoration_finished(now)
    }

    /// Builds the next feedback report. The first report built while the peer
    /// sender is probing is the last to carry a freeze indication: the
    /// episode is closed right after it.
    ///
    /// 构建下一个反馈报告。
    pub fn build_feedback(&mut self, now: Instant) -> Result<FeedbackReport> {
        let probed = self.receiver.freeze_state().mode() == FreezeReceiverMode::Probed;
        let report = self.receiver.build_feedback(now)?;
        if probed {
            let seqno = self.receiver.freeze_state().next_seqno();
            self.receiver.end_probing(seqno)?;
        }
        Ok(report)
    }

    /// Asks the sender whether the next packet may leave.
    pub fn send_packet(&mut self, now: Instant) -> Result<SendDecision> {
        self.sender.send_packet(now)
    }

    /// Handles a timer expiration addressed to this connection.
    pub fn on_timer(&mut self, event: TimerEventData, now: Instant) -> Result<()> {
        if event.connection != self.id {
            warn!(
                connection = self.id,
                target = event.connection,
                "Timer event for another connection"
            );
            return Ok(());
        }
        match event.event {
            TimerEvent::NoFeedback => self.sender.on_no_feedback_timeout(event.handle, now),
        }
    }

    /// Delivers a signal sent by the peer's [`SignalTransport`].
    pub fn on_peer_signal(&mut self, signal: Signal, now: Instant) -> Result<Transition> {
        self.on_signal(signal.kind, signal.seqno, now)
    }

    pub fn terminate(&mut self) {
        self.sender.terminate();
        self.receiver.terminate();
        self.signal_packets_remaining = 0;
    }
}
