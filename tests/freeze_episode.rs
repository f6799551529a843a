//! End-to-end freeze episodes between two connections over tokio timers and
//! signal channels.

pub mod common;

use common::harness::{Pair, RTT};
use freeze_tfrc::freeze::{FreezeReceiverMode, FreezeSenderMode, Transition};
use freeze_tfrc::signal::{Signal, SignalKind};
use freeze_tfrc::tfrc::{SendDecision, SenderState};
use std::time::Duration;
use tokio::time::Instant;

const ROUND: Duration = Duration::from_secs(1);

/// Runs rounds until the sender has a measured receive rate to snapshot.
async fn warm_up(pair: &mut Pair) {
    // Rounds are kept shorter than the no-feedback timeout.
    pair.run_round(ROUND).await;
    for _ in 0..2 {
        pair.run_round(ROUND * 2 / 5).await;
    }
    assert_eq!(pair.a.connection.sender().state(), SenderState::HaveFeedback);
    assert!(pair.a.connection.sender().rate_x_recv() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_episode_restores_pre_freeze_rate() {
    let mut pair = Pair::new();
    warm_up(&mut pair).await;

    // The receiver of the data stream detects an outage and asks for a freeze.
    let freeze = pair.b.connection.next_freeze_seqno();
    assert_eq!(freeze, 1);
    let result = pair.b.connection.receiver_mut().request_freeze(freeze);
    assert_eq!(result.unwrap(), Transition::Applied);
    let results = pair.pump_signals();
    assert!(matches!(results[..], [Ok(Transition::Applied)]));

    let sender = pair.a.connection.sender();
    assert_eq!(sender.freeze_state().mode(), FreezeSenderMode::Frozen);
    let (saved_x_recv, saved_p) = sender.freeze_state().snapshot().unwrap();
    assert_eq!(saved_x_recv, sender.rate_x_recv());
    assert_eq!(saved_p, 0);

    // Nothing leaves and no timer runs for the whole outage.
    assert_eq!(pair.a.timer.pending(), 0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pair.drain_timers(), 0);
    let decision = pair.a.connection.send_packet(Instant::now()).unwrap();
    assert_eq!(decision, SendDecision::Hold);
    assert_eq!(pair.a.connection.sender().rate_x_recv(), saved_x_recv);

    // The outage is over. The sender answers the unfreeze with restoring.
    let unfreeze = pair.b.connection.next_freeze_seqno();
    assert_eq!(unfreeze, 2);
    pair.b.connection.receiver_mut().request_unfreeze(unfreeze).unwrap();
    let results = pair.pump_signals();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| matches!(r, Ok(Transition::Applied))));

    assert_eq!(pair.a.connection.sender().rate_x(), saved_x_recv);
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Restoring
    );
    assert_eq!(
        pair.b.connection.receiver().freeze_state().mode(),
        FreezeReceiverMode::Restoration
    );
    assert_eq!(pair.a.timer.pending(), 1);

    // Restoration lasts one RTT at the receiver.
    tokio::time::sleep(RTT / 2).await;
    assert!(!pair.b.connection.poll(Instant::now()).unwrap());
    tokio::time::sleep(RTT).await;
    assert!(pair.b.connection.poll(Instant::now()).unwrap());
    assert!(!pair.b.connection.poll(Instant::now()).unwrap());
    pair.pump_signals();
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Probing
    );
    assert_eq!(
        pair.b.connection.receiver().freeze_state().mode(),
        FreezeReceiverMode::Probed
    );

    // The first report in probing still carries the indication and closes
    // the receiver's side. The next one, without it, ends probing.
    pair.run_round(ROUND / 4).await;
    assert_eq!(
        pair.b.connection.receiver().freeze_state().mode(),
        FreezeReceiverMode::Normal
    );
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Probing
    );
    pair.run_round(ROUND / 4).await;
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Normal
    );
    assert_eq!(pair.a.connection.sender().freeze_state().snapshot(), None);

    let kinds: Vec<(SignalKind, u64)> = pair.delivered.iter().map(|s| (s.kind, s.seqno)).collect();
    assert_eq!(
        kinds,
        vec![
            (SignalKind::Freeze, 1),
            (SignalKind::Unfreeze, 2),
            (SignalKind::Restoring, 2),
            (SignalKind::Unfrozen, 3),
            (SignalKind::Probing, 3),
        ]
    );

    // A late copy of the first freeze must not start a new episode.
    let stale = Signal {
        connection: pair.b.connection.id(),
        kind: SignalKind::Freeze,
        seqno: freeze,
    };
    let result = pair.a.connection.on_peer_signal(stale, Instant::now());
    assert_eq!(result.unwrap(), Transition::Duplicate);
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Normal
    );

    // A new episode starts from a fresh sequence number.
    assert!(pair.b.connection.next_freeze_seqno() > 3);
}

#[tokio::test(start_paused = true)]
async fn test_missing_feedback_halves_rate() {
    let mut pair = Pair::new();
    warm_up(&mut pair).await;
    let rate = pair.a.connection.sender().rate_x();
    let timeout = pair.a.connection.sender().no_feedback_timeout();
    assert_eq!(timeout, Duration::from_secs(1));

    tokio::time::sleep(timeout + RTT).await;
    assert_eq!(pair.drain_timers(), 1);
    assert_eq!(pair.a.connection.sender().rate_x(), rate / 2);
    assert_eq!(
        pair.a.connection.sender().no_feedback_timeout(),
        timeout * 2
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicated_and_reordered_signals() {
    let mut pair = Pair::new();
    warm_up(&mut pair).await;
    let peer = pair.b.connection.id();
    let signal = |kind, seqno| Signal {
        connection: peer,
        kind,
        seqno,
    };

    let freeze = pair.b.connection.next_freeze_seqno();
    pair.b.connection.receiver_mut().request_freeze(freeze).unwrap();
    pair.pump_signals();
    let now = Instant::now();
    let result = pair.a.connection.on_peer_signal(signal(SignalKind::Freeze, freeze), now);
    assert_eq!(result.unwrap(), Transition::AlreadyInTargetState);

    let unfreeze = pair.b.connection.next_freeze_seqno();
    pair.b.connection.receiver_mut().request_unfreeze(unfreeze).unwrap();
    pair.pump_signals();
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Restoring
    );
    let restored = pair.a.connection.sender().rate_x();

    // The freeze overtaken by the unfreeze arrives late.
    let now = Instant::now();
    let result = pair.a.connection.on_peer_signal(signal(SignalKind::Freeze, freeze), now);
    assert_eq!(result.unwrap(), Transition::Duplicate);
    let result = pair.a.connection.on_peer_signal(signal(SignalKind::Unfreeze, unfreeze), now);
    assert_eq!(result.unwrap(), Transition::AlreadyInTargetState);
    assert_eq!(
        pair.a.connection.sender().freeze_state().mode(),
        FreezeSenderMode::Restoring
    );
    assert_eq!(pair.a.connection.sender().rate_x(), restored);

    // The restoring signal is delivered twice.
    let restoring = Signal {
        connection: pair.a.connection.id(),
        kind: SignalKind::Restoring,
        seqno: unfreeze,
    };
    let result = pair.b.connection.on_peer_signal(restoring, now);
    assert_eq!(result.unwrap(), Transition::AlreadyInTargetState);

    // Replays never produce new signals.
    assert!(pair.pump_signals().is_empty());
    assert_eq!(pair.delivered.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_losses_during_outage_are_not_charged() {
    let mut pair = Pair::new();
    warm_up(&mut pair).await;

    let freeze = pair.b.connection.next_freeze_seqno();
    pair.b.connection.receiver_mut().request_freeze(freeze).unwrap();
    let unfreeze = pair.b.connection.next_freeze_seqno();
    pair.b.connection.receiver_mut().request_unfreeze(unfreeze).unwrap();
    pair.pump_signals();
    assert_eq!(
        pair.b.connection.receiver().freeze_state().mode(),
        FreezeReceiverMode::Restoration
    );

    // Packets lost right after the outage fall into the restoration phase.
    pair.drop_next = 2;
    pair.run_round(RTT / 2).await;
    assert_eq!(pair.drop_next, 0);
    pair.run_round(ROUND / 2).await;
    assert_eq!(pair.a.connection.sender().loss_event_rate(), 0);
}
