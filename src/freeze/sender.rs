//! Freeze-TFRC 发送方状态机
//! Freeze-TFRC sender state machine
//!
//! `Normal → Frozen → Restoring → Probing → Normal`, driven by signals from the
//! peer receiver. On freezing the sender snapshots the receive rate and loss
//! event rate; on unfreezing it resumes at the snapshot instead of collapsing
//! to the no-feedback floor.

use super::{FreezeEpoch, Transition, trace_transition};
use crate::config::FreezeConfig;
use crate::error::{Error, Result, Side};
use crate::signal::{Signal, SignalKind};
use crate::tfrc::{FeedbackReport, P_SCALE, SenderRateState, SenderState, X_SCALE_SHIFT};
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Freeze-TFRC 发送方模式
/// Freeze-TFRC sender modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreezeSenderMode {
    #[default]
    Normal,
    Frozen,
    Restoring,
    Probing,
}

impl FreezeSenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreezeSenderMode::Normal => "normal",
            FreezeSenderMode::Frozen => "frozen",
            FreezeSenderMode::Restoring => "restoring",
            FreezeSenderMode::Probing => "probing",
        }
    }
}

impl fmt::Display for FreezeSenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freeze sub-state attached to the sender's rate state.
///
/// 附加在发送方速率状态上的冻结子状态。
#[derive(Debug, Clone)]
pub struct FreezeSenderState {
    mode: FreezeSenderMode,
    epoch: FreezeEpoch,
    /// Scaled receive rate captured at the Normal → Frozen transition.
    pub(crate) saved_x_recv: u64,
    pub(crate) saved_loss_event_rate: u32,
    trace: bool,
    probing_delta_p: f64,
}

impl FreezeSenderState {
    pub fn new(config: &FreezeConfig) -> Self {
        Self {
            mode: FreezeSenderMode::Normal,
            epoch: FreezeEpoch::default(),
            saved_x_recv: 0,
            saved_loss_event_rate: 0,
            trace: config.trace_transitions,
            probing_delta_p: config.probing_delta_p,
        }
    }

    pub fn mode(&self) -> FreezeSenderMode {
        self.mode
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch.get()
    }

    /// The pre-freeze `(x_recv in bytes/s, loss event rate)`, only while a
    /// freeze episode is in progress.
    ///
    /// 冻结前的快照，仅在冻结阶段进行中有效。
    pub fn snapshot(&self) -> Option<(u64, u32)> {
        (self.mode != FreezeSenderMode::Normal).then_some((
            self.saved_x_recv >> X_SCALE_SHIFT,
            self.saved_loss_event_rate,
        ))
    }
}

impl SenderRateState {
    fn freeze_trace(&self, event: &'static str, seqno: u64) {
        trace_transition(
            self.freeze.trace,
            self.connection(),
            Side::Sender,
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
            side: Side::Sender,
            mode: self.freeze.mode.as_str(),
            event,
        }
    }

    fn send_freeze_signal(&self, kind: SignalKind, seqno: u64) -> Result<()> {
        self.signals.send_signal(Signal {
            connection: self.connection(),
            kind,
            seqno,
        })
    }

    /// The peer asks us to freeze.
    ///
    /// A freeze is never lost: from any mode other than `Normal` it is logged
    /// and forced through, keeping the snapshot taken at the original freeze.
    /// The no-feedback timer is suspended for the duration.
    ///
    /// 对端请求冻结。冻结请求永不丢失。
    pub fn freeze(&mut self, seqno: u64) -> Result<Transition> {
        if self.state() == SenderState::Terminated {
            return Err(Error::Terminated);
        }
        if self.freeze.mode == FreezeSenderMode::Frozen {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale freeze");
            return Ok(Transition::Duplicate);
        }

        let forced = self.freeze.mode != FreezeSenderMode::Normal;
        if forced {
            warn!(
                connection = self.connection(),
                mode = %self.freeze.mode,
                seqno,
                "Freezing while not in normal state"
            );
        } else {
            self.freeze.saved_x_recv = self.x_recv;
            self.freeze.saved_loss_event_rate = self.p;
        }

        self.suspend_no_feedback_timer();
        self.freeze.mode = FreezeSenderMode::Frozen;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("freeze", seqno);
        info!(
            connection = self.connection(),
            saved_x_recv = self.freeze.saved_x_recv >> X_SCALE_SHIFT,
            saved_p = self.freeze.saved_loss_event_rate,
            "Sender frozen"
        );
        Ok(if forced {
            Transition::Forced
        } else {
            Transition::Applied
        })
    }

    /// The peer asks us to unfreeze: resume at the receiver's last known
    /// throughput and tell the receiver we are restoring.
    ///
    /// 对端请求解冻：以接收方最后已知的吞吐量恢复，并通知接收方。
    pub fn unfreeze(&mut self, seqno: u64, now: Instant) -> Result<Transition> {
        if self.state() == SenderState::Terminated {
            return Err(Error::Terminated);
        }
        if self.freeze.mode == FreezeSenderMode::Restoring {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale unfreeze");
            return Ok(Transition::Duplicate);
        }
        if self.freeze.mode != FreezeSenderMode::Frozen {
            return Err(self.unexpected("unfreeze", seqno));
        }

        self.send_freeze_signal(SignalKind::Restoring, seqno)?;

        self.x_recv = self.freeze.saved_x_recv;
        self.p = self.freeze.saved_loss_event_rate;
        self.x = self.freeze.saved_x_recv.max(self.min_rate());
        self.t_nom = now;
        self.t_ld = now;
        self.update_send_interval();
        self.freeze.mode = FreezeSenderMode::Restoring;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("unfreeze", seqno);
        info!(
            connection = self.connection(),
            rate = self.rate_x(),
            "Sender restoring pre-freeze rate"
        );

        let timeout = self.base_no_feedback_timeout();
        self.no_feedback_backoff = timeout;
        self.restart_no_feedback_timer(timeout)?;
        Ok(Transition::Applied)
    }

    /// The receiver finished its restoration phase: re-apply the snapshot
    /// and start probing the restored rate.
    ///
    /// 接收方完成了恢复阶段：重新应用快照并开始探测。
    pub fn receiver_unfrozen(&mut self, seqno: u64) -> Result<Transition> {
        if self.state() == SenderState::Terminated {
            return Err(Error::Terminated);
        }
        if self.freeze.mode == FreezeSenderMode::Probing {
            self.freeze.epoch.record(seqno);
            return Ok(Transition::AlreadyInTargetState);
        }
        if self.freeze.epoch.is_stale(seqno) {
            debug!(connection = self.connection(), seqno, "Discarding stale unfrozen");
            return Ok(Transition::Duplicate);
        }
        if self.freeze.mode != FreezeSenderMode::Restoring {
            return Err(self.unexpected("receiver_unfrozen", seqno));
        }

        self.send_freeze_signal(SignalKind::Probing, seqno)?;

        self.x_recv = self.freeze.saved_x_recv;
        self.freeze.mode = FreezeSenderMode::Probing;
        self.freeze.epoch.record(seqno);
        self.freeze_trace("receiver_unfrozen", seqno);
        debug!(connection = self.connection(), "Sender probing restored rate");
        Ok(Transition::Applied)
    }

    /// Ends probing once a report arrives without any freeze indication, or
    /// when the loss event rate has drifted too far from the snapshot for it
    /// to be trusted any longer.
    pub(crate) fn finish_probing(&mut self, report: &FeedbackReport) {
        if self.freeze.mode != FreezeSenderMode::Probing {
            return;
        }
        let drift = (report.loss_event_rate as f64 - self.freeze.saved_loss_event_rate as f64)
            .abs()
            / P_SCALE as f64;
        if report.freeze.is_none() || drift > self.freeze.probing_delta_p {
            self.freeze.mode = FreezeSenderMode::Normal;
            let seqno = self.freeze.epoch.get().unwrap_or_default();
            self.freeze_trace("probing_complete", seqno);
            info!(
                connection = self.connection(),
                rate = self.rate_x(),
                drift,
                "Freeze episode over, back to normal rate control"
            );
        }
    }
}
