//! Freeze 扩展：在已知的通信中断期间冻结拥塞控制
//! The Freeze extension: suspending congestion control across a known outage
//!
//! 发送方和接收方各自运行一个状态机，通过带序列号的信令协调。信令在不可靠
//! 通道上传输，可能乱序或重复，因此每个转换函数在目标状态已达到时都是
//! 无操作，并丢弃比已记录序列号更旧的信号。
//!
//! The sender and the receiver each run a state machine and coordinate through
//! sequence-numbered signals. Signals travel over an unreliable channel and may
//! be reordered or duplicated, so every transition is a no-op once its target
//! state has been reached, and signals older than the recorded epoch are dropped.
//!
//! A window-based sibling ([`window`]) and the per-connection dispatcher
//! ([`dispatcher`]) live here as well.

use crate::connection::ConnectionId;
use crate::error::Side;
use tracing::debug;

pub mod dispatcher;
pub mod receiver;
pub mod sender;
pub mod window;

pub use dispatcher::{
    DispatchOutcome, FreezeState, HalfConnectionControl, OptionContext, SocketOption,
    dispatch_freeze_state,
};
pub use receiver::{FreezeReceiverMode, FreezeReceiverState};
pub use sender::{FreezeSenderMode, FreezeSenderState};
pub use window::{AckKind, AckSink, FreezeWindowState, FrozenRegistry, RegistryKey, WindowConnection};


/// Freeze sequence numbers are 48 bits wide and compared modulo `2^48`.
/// 冻结序列号为48位，按模 `2^48` 比较。
pub const SEQNO_BITS: u32 = 48;
const SEQNO_MASK: u64 = (1 << SEQNO_BITS) - 1;
const SEQNO_HALF: u64 = 1 << (SEQNO_BITS - 1);

/// Whether `a` comes strictly before `b` in 48-bit serial arithmetic.
/// 在48位序列号算术中 `a` 是否严格位于 `b` 之前。
pub fn seq_before(a: u64, b: u64) -> bool {
    let distance = b.wrapping_sub(a) & SEQNO_MASK;
    distance != 0 && distance < SEQNO_HALF
}

/// Whether `a` comes strictly after `b` in 48-bit serial arithmetic.
pub fn seq_after(a: u64, b: u64) -> bool {
    seq_before(b, a)
}

/// The outcome of a freeze transition that did not fail.
///
/// 未失败的冻结状态转换的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state machine moved to the requested state.
    /// 状态机转换到了请求的状态。
    Applied,
    /// The requested state was already reached; nothing changed.
    /// 已处于请求的状态，没有变化。
    AlreadyInTargetState,
    /// The signal is older than the recorded epoch and was discarded.
    /// 信号比已记录的纪元旧，已丢弃。
    Duplicate,
    /// The transition was not expected from the current state but was
    /// carried out anyway.
    /// 当前状态不应发生该转换，但仍然执行了。
    Forced,
}

impl Transition {
    /// Whether the state machine changed state.
    /// 状态机是否改变了状态。
    pub fn changed_state(&self) -> bool {
        matches!(self, Transition::Applied | Transition::Forced)
    }
}

/// The sequence number tagging the last mode change of a freeze state machine.
///
/// 标记冻结状态机最近一次模式变化的序列号。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreezeEpoch(Option<u64>);

impl FreezeEpoch {
    pub fn get(&self) -> Option<u64> {
        self.0
    }

    /// Whether a signal tagged `seqno` is older than the epoch.
    pub fn is_stale(&self, seqno: u64) -> bool {
        matches!(self.0, Some(epoch) if seq_before(seqno & SEQNO_MASK, epoch))
    }

    /// Whether `seqno` is no newer than the epoch.
    pub fn covers(&self, seqno: u64) -> bool {
        matches!(self.0, Some(epoch) if !seq_after(seqno & SEQNO_MASK, epoch))
    }

    /// Moves the epoch forward to `seqno`. Never moves it backwards.
    pub fn record(&mut self, seqno: u64) {
        if !self.is_stale(seqno) {
            self.0 = Some(seqno & SEQNO_MASK);
        }
    }

    /// The sequence number following the epoch.
    pub fn next(&self) -> u64 {
        self.0.map_or(1, |epoch| (epoch + 1) & SEQNO_MASK)
    }
}

/// Emits the diagnostic trace of one transition when enabled in [`crate::config::FreezeConfig`].
pub(crate) fn trace_transition(
    enabled: bool,
    connection: ConnectionId,
    side: Side,
    mode: &'static str,
    event: &'static str,
    seqno: u64,
) {
    if enabled {
        debug!(connection, %side, mode, event, seqno, "Freeze transition");
    }
}
