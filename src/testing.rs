//! 测试辅助工具模块
//! Test utilities module
//!
//! In-memory stand-ins for the collaborators of the rate controller.

#![cfg(test)]

use crate::config::Config;
use crate::connection::{Collaborators, Connection, ConnectionId};
use crate::error::{CollaboratorError, Result};
use crate::freeze::{AckKind, AckSink};
use crate::signal::{Signal, SignalKind, SignalTransport};
use crate::tfrc::{ArrivalSample, LossHistory, PacketHistory, ReceiverRateState, SenderRateState};
use crate::timer::{TimerEvent, TimerFacility, TimerHandle};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const TEST_CONNECTION: ConnectionId = 7;

/// Records every signal instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingSignals {
    sent: Mutex<Vec<Signal>>,
    closed: AtomicBool,
}

impl RecordingSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every further send fail as if the channel were closed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<Signal> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn kinds(&self) -> Vec<(SignalKind, u64)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.kind, s.seqno))
            .collect()
    }
}

impl SignalTransport for RecordingSignals {
    fn send_signal(&self, signal: Signal) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollaboratorError::ChannelClosed.into());
        }
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }
}

/// A timer that never fires on its own; tests inspect and fire it by hand.
#[derive(Debug, Default)]
pub struct ManualTimer {
    next_id: AtomicU64,
    active: Mutex<Vec<(TimerHandle, Duration)>>,
    cancelled: Mutex<Vec<TimerHandle>>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The single armed timer, if any.
    pub fn armed(&self) -> Option<(TimerHandle, Duration)> {
        self.active.lock().unwrap().last().copied()
    }

    pub fn armed_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn cancelled(&self) -> Vec<TimerHandle> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl TimerFacility for ManualTimer {
    fn schedule(
        &self,
        _connection: ConnectionId,
        delay: Duration,
        _event: TimerEvent,
    ) -> Result<TimerHandle> {
        let handle = TimerHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.active.lock().unwrap().push((handle, delay));
        Ok(handle)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut active = self.active.lock().unwrap();
        if let Some(pos) = active.iter().position(|(h, _)| *h == handle) {
            active.remove(pos);
            self.cancelled.lock().unwrap().push(handle);
        }
    }
}

/// Shared view of what the scripted histories were asked to do.
#[derive(Debug, Default)]
pub struct HistoryLog {
    /// Samples returned by the next arrivals, in order. Empty means "nothing learned".
    pub script: VecDeque<ArrivalSample>,
    pub rtt_paused: bool,
    pub pause_calls: usize,
    pub resume_calls: usize,
    pub losses: Vec<u64>,
    pub resets: usize,
    /// Loss event rate reported by the loss history.
    pub p: u32,
    pub fail_reset: bool,
}

pub type SharedLog = Arc<Mutex<HistoryLog>>;

pub struct ScriptedPacketHistory(SharedLog);

impl PacketHistory for ScriptedPacketHistory {
    fn record_arrival(
        &mut self,
        _seqno: u64,
        _size: usize,
        _timestamp: Instant,
        _window_counter: u8,
    ) -> Result<ArrivalSample> {
        let mut log = self.0.lock().unwrap();
        let mut sample = log.script.pop_front().unwrap_or_default();
        if log.rtt_paused {
            sample.rtt_sample = None;
        }
        Ok(sample)
    }

    fn pause_rtt_sampling(&mut self) -> Result<()> {
        let mut log = self.0.lock().unwrap();
        log.rtt_paused = true;
        log.pause_calls += 1;
        Ok(())
    }

    fn resume_rtt_sampling(&mut self) -> Result<()> {
        let mut log = self.0.lock().unwrap();
        log.rtt_paused = false;
        log.resume_calls += 1;
        Ok(())
    }
}

pub struct ScriptedLossHistory(SharedLog);

impl LossHistory for ScriptedLossHistory {
    fn register_loss(&mut self, seqno: u64, _timestamp: Instant) -> Result<()> {
        self.0.lock().unwrap().losses.push(seqno);
        Ok(())
    }

    fn current_loss_event_rate(&self) -> u32 {
        self.0.lock().unwrap().p
    }

    fn reset(&mut self) -> Result<()> {
        let mut log = self.0.lock().unwrap();
        if log.fail_reset {
            return Err(CollaboratorError::LossHistory("reset refused".into()).into());
        }
        log.resets += 1;
        log.p = 0;
        Ok(())
    }
}

pub fn histories() -> (Box<dyn PacketHistory>, Box<dyn LossHistory>, SharedLog) {
    let log = SharedLog::default();
    (
        Box::new(ScriptedPacketHistory(log.clone())),
        Box::new(ScriptedLossHistory(log.clone())),
        log,
    )
}

/// Records acknowledgements emitted by window connections.
#[derive(Debug, Default)]
pub struct RecordingAcks {
    sent: Mutex<Vec<(ConnectionId, AckKind)>>,
    /// Acks fail once this many have been sent.
    limit: Mutex<Option<usize>>,
}

impl RecordingAcks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_after(&self, sent: usize) {
        *self.limit.lock().unwrap() = Some(sent);
    }

    pub fn sent(&self) -> Vec<(ConnectionId, AckKind)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, connection: ConnectionId, kind: AckKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, k)| *c == connection && *k == kind)
            .count()
    }
}

impl AckSink for RecordingAcks {
    fn send_ack(&self, connection: ConnectionId, kind: AckKind) -> Result<()> {
        let mut sent = self.sent.lock().unwrap();
        if self.limit.lock().unwrap().is_some_and(|limit| sent.len() >= limit) {
            return Err(CollaboratorError::Ack("link down".into()).into());
        }
        sent.push((connection, kind));
        Ok(())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.freeze.trace_transitions = true;
    config
}

pub fn sender_with(
    config: &Config,
    now: Instant,
) -> (SenderRateState, Arc<ManualTimer>, Arc<RecordingSignals>) {
    let timer = ManualTimer::new();
    let signals = RecordingSignals::new();
    let sender = SenderRateState::new(TEST_CONNECTION, config, timer.clone(), signals.clone(), now);
    (sender, timer, signals)
}

pub fn receiver_with(
    config: &Config,
    now: Instant,
) -> (ReceiverRateState, Arc<RecordingSignals>, SharedLog) {
    let signals = RecordingSignals::new();
    let (packet_history, loss_history, log) = histories();
    let receiver = ReceiverRateState::new(
        TEST_CONNECTION,
        config,
        packet_history,
        loss_history,
        signals.clone(),
        now,
    );
    (receiver, signals, log)
}

pub struct TestConnection {
    pub connection: Connection,
    pub timer: Arc<ManualTimer>,
    pub signals: Arc<RecordingSignals>,
    pub log: SharedLog,
}

pub fn connection_with(config: &Config, now: Instant) -> TestConnection {
    let timer = ManualTimer::new();
    let signals = RecordingSignals::new();
    let (packet_history, loss_history, log) = histories();
    let connection = Connection::new(
        TEST_CONNECTION,
        config,
        Collaborators {
            timer: timer.clone(),
            signals: signals.clone(),
            packet_history,
            loss_history,
        },
        now,
    );
    TestConnection {
        connection,
        timer,
        signals,
        log,
    }
}

/// Brings a sender into `HaveFeedback` with the given receive rate and loss
/// event rate, using a 100 ms RTT.
pub fn sender_with_feedback(
    config: &Config,
    x_recv: u32,
    p: u32,
    now: Instant,
) -> (SenderRateState, Arc<ManualTimer>, Arc<RecordingSignals>) {
    let (mut sender, timer, signals) = sender_with(config, now);
    sender.send_packet(now).unwrap();
    sender
        .on_feedback_received(
            &crate::tfrc::FeedbackReport {
                x_recv,
                loss_event_rate: p,
                freeze: None,
            },
            Some(Duration::from_millis(100)),
            now,
        )
        .unwrap();
    (sender, timer, signals)
}
