//! tests/common/harness.rs
use freeze_tfrc::config::Config;
use freeze_tfrc::connection::{Collaborators, Connection, ConnectionId};
use freeze_tfrc::error::{Error, Result};
use freeze_tfrc::freeze::Transition;
use freeze_tfrc::signal::{ChannelSignalTransport, Signal};
use freeze_tfrc::tfrc::{ArrivalSample, LossHistory, PacketHistory, SendDecision};
use freeze_tfrc::timer::{TimerEventData, TokioTimer};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// The one-way path delay both peers see.
pub const RTT: Duration = Duration::from_millis(50);
pub const PACKET_SIZE: usize = 1000;
/// Loss event rate charged per registered loss.
pub const LOSS_STEP: u32 = 10_000;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "freeze_tfrc=debug,freeze_episode=info".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Detects gaps in the sequence space and samples the fixed path RTT.
#[derive(Debug, Default)]
pub struct GapHistory {
    last_seqno: Option<u64>,
    paused: bool,
}

impl PacketHistory for GapHistory {
    fn record_arrival(
        &mut self,
        seqno: u64,
        _size: usize,
        _timestamp: Instant,
        _window_counter: u8,
    ) -> Result<ArrivalSample> {
        let loss_event = self.last_seqno.is_some_and(|last| seqno > last + 1);
        self.last_seqno = Some(self.last_seqno.map_or(seqno, |last| last.max(seqno)));
        Ok(ArrivalSample {
            rtt_sample: (!self.paused).then_some(RTT),
            loss_event,
        })
    }

    fn pause_rtt_sampling(&mut self) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn resume_rtt_sampling(&mut self) -> Result<()> {
        self.paused = false;
        Ok(())
    }
}

/// Each loss event adds a fixed step to the loss event rate.
#[derive(Debug, Default)]
pub struct SteppedLossHistory {
    p: u32,
}

impl LossHistory for SteppedLossHistory {
    fn register_loss(&mut self, _seqno: u64, _timestamp: Instant) -> Result<()> {
        self.p = self.p.saturating_add(LOSS_STEP);
        Ok(())
    }

    fn current_loss_event_rate(&self) -> u32 {
        self.p
    }

    fn reset(&mut self) -> Result<()> {
        self.p = 0;
        Ok(())
    }
}

/// One connection and the channels its collaborators report into.
pub struct Peer {
    pub connection: Connection,
    pub signals: mpsc::UnboundedReceiver<Signal>,
    pub timer_events: mpsc::Receiver<TimerEventData>,
    pub timer: TokioTimer,
}

impl Peer {
    pub fn new(id: ConnectionId, config: &Config) -> Self {
        let (timer, timer_events) = TokioTimer::new(16);
        let (transport, signals) = ChannelSignalTransport::new();
        let connection = Connection::new(
            id,
            config,
            Collaborators {
                timer: Arc::new(timer.clone()),
                signals: Arc::new(transport),
                packet_history: Box::new(GapHistory::default()),
                loss_history: Box::new(SteppedLossHistory::default()),
            },
            Instant::now(),
        );
        Self {
            connection,
            signals,
            timer_events,
            timer,
        }
    }
}

/// A data sender `a` and a data receiver `b`, wired back to back with a
/// lossless signal path.
pub struct Pair {
    pub a: Peer,
    pub b: Peer,
    next_seqno: u64,
    /// Data packets to drop before they reach `b`.
    pub drop_next: usize,
    /// Signals delivered so far, in order.
    pub delivered: Vec<Signal>,
}

impl Pair {
    pub fn new() -> Self {
        init_tracing();
        let mut config = Config::default();
        config.tfrc.packet_size = PACKET_SIZE;
        config.freeze.trace_transitions = true;
        Self {
            a: Peer::new(1, &config),
            b: Peer::new(2, &config),
            next_seqno: 1,
            drop_next: 0,
            delivered: Vec::new(),
        }
    }

    /// Delivers every queued signal to the other peer until both queues are empty.
    pub fn pump_signals(&mut self) -> Vec<Result<Transition>> {
        let mut results = Vec::new();
        loop {
            let now = Instant::now();
            if let Ok(signal) = self.a.signals.try_recv() {
                results.push(self.b.connection.on_peer_signal(signal, now));
                self.delivered.push(signal);
            } else if let Ok(signal) = self.b.signals.try_recv() {
                results.push(self.a.connection.on_peer_signal(signal, now));
                self.delivered.push(signal);
            } else {
                return results;
            }
        }
    }

    /// Feeds expired timers back into `a`. Returns how many fired.
    pub fn drain_timers(&mut self) -> usize {
        let mut fired = 0;
        while let Ok(event) = self.a.timer_events.try_recv() {
            self.a
                .connection
                .on_timer(event, Instant::now())
                .expect("timer handling failed");
            fired += 1;
        }
        fired
    }

    /// Lets `a` send paced data to `b` for `duration` of virtual time, then
    /// delivers `b`'s feedback to `a`. Returns the number of packets sent.
    pub async fn run_round(&mut self, duration: Duration) -> usize {
        let start = Instant::now();
        let mut sent = 0;
        while start.elapsed() < duration {
            let now = Instant::now();
            match self.a.connection.send_packet(now).expect("send failed") {
                SendDecision::SendNow { window_counter } => {
                    let seqno = self.next_seqno;
                    self.next_seqno += 1;
                    sent += 1;
                    if self.drop_next > 0 {
                        self.drop_next -= 1;
                    } else {
                        self.b
                            .connection
                            .on_data(seqno, PACKET_SIZE, window_counter, now)
                            .expect("receive failed");
                    }
                }
                SendDecision::Delay(wait) => {
                    tokio::time::sleep(wait.min(duration.saturating_sub(start.elapsed()))).await;
                }
                SendDecision::Hold => {
                    tokio::time::sleep(duration.saturating_sub(start.elapsed())).await;
                }
            }
            self.pump_signals();
            self.drain_timers();
        }
        self.feedback();
        sent
    }

    /// Sends one feedback report from `b` to `a`.
    pub fn feedback(&mut self) {
        let now = Instant::now();
        let report = self.b.connection.build_feedback(now).expect("feedback failed");
        match self.a.connection.on_feedback(&report, Some(RTT), now) {
            Ok(()) | Err(Error::UnexpectedState { .. }) => {}
            Err(error) => panic!("feedback handling failed: {}", error),
        }
        self.pump_signals();
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new()
    }
}
