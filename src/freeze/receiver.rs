//! Freeze-TFRC 接收方状态机
//! Freeze-TFRC receiver state machine
//!
//! The receiver drives a freeze episode: it asks the sender to freeze and
//! unfreeze, waits one RTT of restoration after the sender reports that it
//! resumed, then lets the sender probe the restored rate before discarding the
//! loss statistics gathered around the outage.
//!
//! 接收方驱动冻结阶段：请求发送方冻结与解冻，在发送方恢复后等待一个RTT的
//! 恢复期，然后让发送方探测恢复的速率，最后丢弃中断期间的丢包统计。

use super::{FreezeEpoch, Transition, trace_transition};
use crate::config::FreezeConfig;
use crate::error::{Error, Result, Side};
use crate::packet::FreezeIndication;
use crate::signal::{Signal, SignalKind};
use crate::tfrc::{ReceiverRateState, ReceiverState};
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Freeze-TFRC 接收方模式
/// Freeze-TFRC receiver modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreezeReceiverMode {
    #[default]
    Normal,
    /// A freeze was requested from the sender.
    SignalFreeze,
    /// An unfreeze was requested from the sender.
    SignalUnfreeze,
    /// The sender resumed; waiting one RTT for its rate to settle.
    Restoration,
    /// Restoration finished; waiting for the sender to start probing.
    Recovery1,
    /// Reserved. No transition enters it.
    Recovery2,
    /// The sender is probing the restored rate.
    Probed,
}

impl FreezeReceiverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreezeReceiverMode::Normal => "normal",
            FreezeReceiverMode::SignalFreeze => "signal_freeze",
            FreezeReceiverMode::SignalUnfreeze => "signal_unfreeze",
            FreezeReceiverMode::Restoration => "restoration",
            FreezeReceiverMode::Recovery1 => "recovery1",
            FreezeReceiverMode::Recovery2 => "recovery2",
            FreezeReceiverMode::Probed => "probed",
        }
    }
}

impl fmt::Display for FreezeReceiverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freeze sub-state attached to the receiver's rate state.
///
/// 附加在接收方速率状态上的冻结子状态。
#[derive(Debug, Clone)]
pub struct FreezeReceiverState {
    mode: FreezeReceiverMode,
    epoch: FreezeEpoch,
    restoration_deadline: Option<Instant>,
    sender_freeze_echo: Option<FreezeIndication>,
    rtt_sampling_paused: bool,
    trace: bool,
}

impl FreezeReceiverState {
    pub fn new(config: &FreezeConfig) -> Self {
        Self {
            mode: FreezeReceiverMode::Normal,
            epoch: FreezeEpoch::default(),
            restoration_deadline: None,
            sender_freeze_echo: None,
            rtt_sampling_paused: false,
            trace: config.trace_transitions,
        }
    }

    pub fn mode(&self) -> FreezeReceiverMode {
        self.mode
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch.get()
    }

    /// The sequence number the receiver tags its next self-originated signal with.
    pub fn next_seqno(&self) -> u64 {
        self.epoch.next()
    }

    pub fn restoration_deadline(&self) -> Option<Instant> {
        self.restoration_deadline
    }

    /// The last indication the sender echoed back (restoring or probing).
    pub fn sender_freeze_echo(&self) -> Option<FreezeIndication> {
        self.sender_freeze_echo
    }

    /// Loss events around the outage are not charged to the loss history.
    ///
    /// 中断期间的丢包事件不计入丢包历史。
    pub fn loss_accounting_enabled(&self) -> bool {
        !matches!(
            self.mode,
            FreezeReceiverMode::SignalFreeze
                | FreezeReceiverMode::SignalUnfreeze
                | FreezeReceiverMode::Restoration
        )
    }

    /// The freeze indication carried by outgoing feedback in the current mode.
    ///
    /// 当前模式下反馈中携带的冻结指示。
    pub fn outbound_indication(&self) -> Option<FreezeIndication> {
        let seqno = self.epoch.get()?;
        let kind = match self.mode {
            FreezeReceiverMode::SignalFreeze => SignalKind::Freeze,
            FreezeReceiverMode::SignalUnfreeze => SignalKind::Unfreeze,
            FreezeReceiverMode::Recovery1
            | FreezeReceiverMode::Recovery2
            | FreezeReceiverMode::Probed => SignalKind::Unfrozen,
            FreezeReceiverMode::Normal | FreezeReceiverMode::Restoration => return None,
        };
        Some(FreezeIndication { kind, seqno })
    }
}

impl ReceiverRateState {
    fn freeze_trace(&self, event: &'static str, seqno: u64) {
        trace_transition(
            self.freeze.trace,
            self.connection(),
            Side::Receiver,
            self.freeze.mode.as_str(),
            event,
            seqno,
        );
    }

    fn unexpected(&self, event: &'static str, seqno: u64) -> Error {
        warn!(
            connection = self.connection(),
            mode = %self.freeze.mode,
            event,
            seqno,
            "Freeze signal in unexpected state"
        );
        Error::UnexpectedState {
            side: Side::Receiver,
            mode: self.freeze.mode.as_str(),
            event,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == ReceiverState::Terminated {
            return Err(Error::Terminated);
        }
        Ok(())
    }

    fn send_freeze_signal(&self, kind: SignalKind, seqno: u64) -> Result<()> {
        self.signals.send_signal(Signal {
            connection: self.connection(),
            kind,
            seqno,
        })
    }

    /// Asks the peer sender to freeze.
    ///
    /// Never refused: from a mode outside the request phase the episode in
    /// progress is abandoned with a warning and a new one begins.
    ///
    /// 请求对端发送方冻结。该请求永不被拒绝。
    pub fn request_freeze(&mut self, seqno: u64) -> Result<Transition> {
        self.ensure_live()?;
        if self.freeze.mode == FreezeReceiverMode::SignalFreeze {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale freeze request");
            return Ok(Transition::Duplicate);
        }

        let forced = !matches!(
            self.freeze.mode,
            FreezeReceiverMode::Normal | FreezeReceiverMode::SignalUnfreeze
        );
        if forced {
            warn!(
                connection = self.connection(),
                mode = %self.freeze.mode,
                seqno,
                "Freeze requested in the middle of an episode"
            );
        }

        // The signal goes out last: a failure before it leaves the receiver
        // exactly as it was.
        self.packet_history.pause_rtt_sampling()?;
        if let Err(error) = self.send_freeze_signal(SignalKind::Freeze, seqno) {
            if !self.freeze.rtt_sampling_paused {
                if let Err(resume) = self.packet_history.resume_rtt_sampling() {
                    warn!(connection = self.connection(), %resume, "Could not resume RTT sampling");
                }
            }
            return Err(error);
        }

        self.freeze.rtt_sampling_paused = true;
        self.freeze.restoration_deadline = None;
        self.freeze.mode = FreezeReceiverMode::SignalFreeze;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("request_freeze", seqno);
        info!(connection = self.connection(), seqno, "Freeze requested");
        Ok(if forced {
            Transition::Forced
        } else {
            Transition::Applied
        })
    }

    /// Asks the peer sender to unfreeze. Only valid while a freeze is requested.
    ///
    /// 请求对端发送方解冻。仅在已请求冻结时有效。
    pub fn request_unfreeze(&mut self, seqno: u64) -> Result<Transition> {
        self.ensure_live()?;
        if self.freeze.mode == FreezeReceiverMode::SignalUnfreeze {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale unfreeze request");
            return Ok(Transition::Duplicate);
        }
        if self.freeze.mode != FreezeReceiverMode::SignalFreeze {
            return Err(self.unexpected("request_unfreeze", seqno));
        }

        self.send_freeze_signal(SignalKind::Unfreeze, seqno)?;
        self.freeze.mode = FreezeReceiverMode::SignalUnfreeze;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("request_unfreeze", seqno);
        info!(connection = self.connection(), seqno, "Unfreeze requested");
        Ok(Transition::Applied)
    }

    /// The sender reports that it resumed at its pre-freeze rate. Restoration
    /// lasts one RTT estimate from `now`.
    ///
    /// 发送方报告已恢复冻结前的速率。恢复期从 `now` 起持续一个RTT估计。
    pub fn on_sender_restoring(&mut self, seqno: u64, now: Instant) -> Result<Transition> {
        self.ensure_live()?;
        if self.freeze.mode == FreezeReceiverMode::Restoration {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale restoring signal");
            return Ok(Transition::Duplicate);
        }
        if !matches!(
            self.freeze.mode,
            FreezeReceiverMode::Normal | FreezeReceiverMode::SignalUnfreeze
        ) {
            return Err(self.unexpected("sender_restoring", seqno));
        }

        let deadline = now + self.rtt_estimate();
        self.freeze.restoration_deadline = Some(deadline);
        self.freeze.sender_freeze_echo = Some(FreezeIndication {
            kind: SignalKind::Restoring,
            seqno,
        });
        self.freeze.mode = FreezeReceiverMode::Restoration;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("sender_restoring", seqno);
        debug!(
            connection = self.connection(),
            seqno,
            restoration = ?self.rtt_estimate(),
            "Sender restoring, restoration phase started"
        );
        Ok(Transition::Applied)
    }

    /// Polls the restoration deadline. Returns `true` exactly once per
    /// episode, on the first poll strictly after the deadline, after telling
    /// the sender that the receiver is unfrozen.
    ///
    /// 轮询恢复期截止时间。每个冻结阶段仅返回一次 `true`。
    pub fn check_restoration_finished(&mut self, now: Instant) -> Result<bool> {
        self.ensure_live()?;
        if self.freeze.mode != FreezeReceiverMode::Restoration {
            return Ok(false);
        }
        let Some(deadline) = self.freeze.restoration_deadline else {
            return Ok(false);
        };
        if now <= deadline {
            return Ok(false);
        }

        let seqno = self.freeze.epoch.next();
        self.send_freeze_signal(SignalKind::Unfrozen, seqno)?;
        self.freeze.restoration_deadline = None;
        self.freeze.mode = FreezeReceiverMode::Recovery1;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("restoration_finished", seqno);
        debug!(connection = self.connection(), seqno, "Restoration finished");
        Ok(true)
    }

    /// The sender started probing the restored rate.
    ///
    /// 发送方开始探测恢复的速率。
    pub fn on_sender_probing(&mut self, seqno: u64) -> Result<Transition> {
        self.ensure_live()?;
        if self.freeze.mode == FreezeReceiverMode::Probed {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale probing signal");
            return Ok(Transition::Duplicate);
        }
        if self.freeze.mode != FreezeReceiverMode::Recovery1 {
            return Err(self.unexpected("sender_probing", seqno));
        }

        self.freeze.sender_freeze_echo = Some(FreezeIndication {
            kind: SignalKind::Probing,
            seqno,
        });
        self.freeze.mode = FreezeReceiverMode::Probed;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("sender_probing", seqno);
        Ok(Transition::Applied)
    }

    /// Closes the freeze episode: the loss history is reset so losses from
    /// before the outage do not bias the new rate, and RTT sampling resumes.
    ///
    /// 结束冻结阶段：重置丢包历史并恢复RTT采样。
    pub fn end_probing(&mut self, seqno: u64) -> Result<Transition> {
        self.ensure_live()?;
        if self.freeze.mode == FreezeReceiverMode::Normal && self.freeze.epoch.covers(seqno) {
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale end of probing");
            return Ok(Transition::Duplicate);
        }
        if self.freeze.mode != FreezeReceiverMode::Probed {
            return Err(self.unexpected("end_probing", seqno));
        }

        self.loss_history.reset()?;
        self.packet_history.resume_rtt_sampling()?;
        self.freeze.rtt_sampling_paused = false;
        self.freeze.sender_freeze_echo = None;
        self.freeze.mode = FreezeReceiverMode::Normal;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("end_probing", seqno);
        info!(connection = self.connection(), seqno, "Freeze episode complete");
        Ok(Transition::Applied)
    }
}
