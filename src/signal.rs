//! 冻结信令的出站传输。
//! Outbound transport for freeze signals.
//!
//! Freeze and unfreeze indications travel between the two peers over an
//! unreliable channel. The state machines only know how to hand a signal to a
//! [`SignalTransport`]; how it is carried (options on the next data packet, a
//! dedicated control packet, ...) is up to the implementation.

use crate::connection::ConnectionId;
use crate::error::{CollaboratorError, Result};
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;

/// The kinds of freeze signal exchanged between peers.
/// 对端之间交换的冻结信号类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// (Receiver → sender) Suspend rate evolution.
    /// （接收方 → 发送方）暂停速率演进。
    Freeze,
    /// (Receiver → sender) The outage is over, resume.
    /// （接收方 → 发送方）中断结束，恢复。
    Unfreeze,
    /// (Receiver → sender) The restoration phase has completed.
    /// （接收方 → 发送方）恢复阶段已完成。
    Unfrozen,
    /// (Sender → receiver) The sender has restored its pre-freeze rate.
    /// （发送方 → 接收方）发送方已恢复冻结前的速率。
    Restoring,
    /// (Sender → receiver) The sender is probing the restored rate.
    /// （发送方 → 接收方）发送方正在探测恢复的速率。
    Probing,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Freeze => "FREEZE",
            SignalKind::Unfreeze => "UNFREEZE",
            SignalKind::Unfrozen => "UNFROZEN",
            SignalKind::Restoring => "RESTORING",
            SignalKind::Probing => "PROBING",
        };
        write!(f, "{}", s)
    }
}

/// A freeze signal tagged with the sequence number of its freeze episode step.
/// 带有冻结阶段序列号的冻结信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub connection: ConnectionId,
    pub kind: SignalKind,
    pub seqno: u64,
}

/// Something that can carry a freeze signal to the peer.
///
/// 能够将冻结信号传送给对端的对象。
pub trait SignalTransport: Send + Sync + 'static {
    /// Schedules `signal` for transmission. Must not block.
    ///
    /// 安排发送 `signal`。不得阻塞。
    fn send_signal(&self, signal: Signal) -> Result<()>;
}

/// A [`SignalTransport`] that forwards every signal into a tokio channel,
/// where the connection's I/O task picks it up and attaches it to outgoing packets.
///
/// 将每个信号转发到 tokio 通道的 [`SignalTransport`]。
#[derive(Debug, Clone)]
pub struct ChannelSignalTransport {
    tx: mpsc::UnboundedSender<Signal>,
}

impl ChannelSignalTransport {
    /// Creates a transport and the receiving end of its channel.
    /// 创建传输及其通道的接收端。
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalTransport for ChannelSignalTransport {
    fn send_signal(&self, signal: Signal) -> Result<()> {
        trace!(
            connection = signal.connection,
            kind = %signal.kind,
            seqno = signal.seqno,
            "Queueing freeze signal"
        );
        self.tx
            .send(signal)
            .map_err(|_| CollaboratorError::ChannelClosed.into())
    }
}
