//! 冻结请求分发器
//! Freeze request dispatcher
//!
//! Fans a freeze-state change out to the receiver half and the sender half of
//! one connection through the generic per-half option interface, and gathers
//! both results. A half that fails is logged; the other half still runs.

use super::Transition;
use crate::error::{Error, Result};
use crate::tfrc::{ReceiverRateState, SenderRateState};
use tokio::time::Instant;
use tracing::{debug, warn};

/// 半连接套接字选项
/// Per-half-connection socket options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    FreezeState,
}

/// 冻结选项的取值
/// Values of the freeze-state option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FreezeState {
    Unfrozen = 0,
    Frozen = 1,
}

impl TryFrom<u32> for FreezeState {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FreezeState::Unfrozen),
            1 => Ok(FreezeState::Frozen),
            other => Err(Error::InvalidOptionValue(other)),
        }
    }
}

impl From<FreezeState> for u32 {
    fn from(state: FreezeState) -> Self {
        state as u32
    }
}

/// What a half-connection needs besides the option value.
#[derive(Debug, Clone, Copy)]
pub struct OptionContext {
    /// Sequence number tagging the request.
    pub seqno: u64,
    pub now: Instant,
}

/// The generic configuration interface of one half-connection.
///
/// 单个半连接的通用配置接口。
pub trait HalfConnectionControl {
    fn set_option(&mut self, option: SocketOption, value: u32, ctx: OptionContext)
    -> Result<Transition>;
}

impl HalfConnectionControl for SenderRateState {
    fn set_option(
        &mut self,
        option: SocketOption,
        value: u32,
        ctx: OptionContext,
    ) -> Result<Transition> {
        match option {
            SocketOption::FreezeState => match FreezeState::try_from(value)? {
                FreezeState::Frozen => self.freeze(ctx.seqno),
                FreezeState::Unfrozen => self.unfreeze(ctx.seqno, ctx.now),
            },
        }
    }
}

impl HalfConnectionControl for ReceiverRateState {
    fn set_option(
        &mut self,
        option: SocketOption,
        value: u32,
        ctx: OptionContext,
    ) -> Result<Transition> {
        match option {
            SocketOption::FreezeState => match FreezeState::try_from(value)? {
                FreezeState::Frozen => self.request_freeze(ctx.seqno),
                FreezeState::Unfrozen => self.request_unfreeze(ctx.seqno),
            },
        }
    }
}

/// The results of both halves of one dispatch.
///
/// 一次分发中两个半连接的结果。
#[derive(Debug)]
pub struct DispatchOutcome {
    /// `None` when the receiver half was not asked.
    pub receiver: Option<Result<Transition>>,
    pub sender: Result<Transition>,
}

impl DispatchOutcome {
    /// Whether no half reported an error.
    pub fn is_clean(&self) -> bool {
        self.sender.is_ok() && self.receiver.as_ref().is_none_or(|result| result.is_ok())
    }

    /// Whether the receiver half changed state.
    pub fn receiver_changed(&self) -> bool {
        matches!(&self.receiver, Some(Ok(transition)) if transition.changed_state())
    }
}

/// Applies a freeze-state change to both halves of a connection.
///
/// The receiver half is only asked when `receiver_only` is set; the sender
/// half is always asked. Errors are logged and returned in the outcome, never
/// raised.
///
/// 将冻结状态变化应用到连接的两个半连接。错误会被记录并返回，但不会抛出。
pub fn dispatch_freeze_state(
    receiver: &mut dyn HalfConnectionControl,
    sender: &mut dyn HalfConnectionControl,
    receiver_only: bool,
    value: u32,
    ctx: OptionContext,
) -> DispatchOutcome {
    let receiver = receiver_only.then(|| {
        let result = receiver.set_option(SocketOption::FreezeState, value, ctx);
        if let Err(error) = &result {
            warn!(%error, value, seqno = ctx.seqno, "Receiver half rejected freeze state");
        }
        result
    });

    let sender = sender.set_option(SocketOption::FreezeState, value, ctx);
    if let Err(error) = &sender {
        warn!(%error, value, seqno = ctx.seqno, "Sender half rejected freeze state");
    }

    let outcome = DispatchOutcome { receiver, sender };
    debug!(value, seqno = ctx.seqno, clean = outcome.is_clean(), "Freeze state dispatched");
    outcome
}
