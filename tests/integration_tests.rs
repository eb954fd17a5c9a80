//! Integration tests for the rendezvous pairing engine
//!
//! These run the whole engine against the in-memory queue store:
//! - Immediate and deferred pairing
//! - Arrival order of waiting users
//! - Timeouts and cancellation
//! - Compensation when the chat service fails
//! - Events emitted along the way

mod fixtures;

use fixtures::{
    create_test_system, create_test_system_with, expect_paired, expect_pending, settle,
    test_config, RecordingSessionCreator,
};
use rendezvous::error::MatchmakingError;
use rendezvous::pairing::PairingConfig;
use rendezvous::queue::QueueStore;
use rendezvous::types::{AmqpMessage, WaitEndReason, WaitingTicket};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_first_user_waits_second_user_pairs() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);
    assert_eq!(system.store.snapshot(), vec![7]);
    let waiting = tokio::spawn(pending.wait());

    // Nobody else around: user 7 hears nothing for a full second
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiting.is_finished());

    let chat_session_id = expect_paired(orchestrator.find_match(9, CancellationToken::new()).await);
    assert_eq!(waiting.await.unwrap(), Ok(chat_session_id.clone()));

    // Both sides are gone from the queue and the registry
    assert!(system.store.snapshot().is_empty());
    assert!(system.registry.is_empty());

    let sessions = system.sessions.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].chat_session_id, chat_session_id);
    assert_eq!((sessions[0].requester, sessions[0].partner), (9, 7));

    settle().await;
    let completed: Vec<_> = system
        .events
        .get_published_events()
        .into_iter()
        .filter_map(|event| match event {
            AmqpMessage::PairingCompleted(completed) => Some(completed),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].requester_id, 9);
    assert_eq!(completed[0].partner_id, 7);

    let stats = orchestrator.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.immediate_pairings, 1);
    assert_eq!(stats.players_waiting, 0);
}

#[tokio::test]
async fn test_arrivals_pair_in_order() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    let first = expect_pending(orchestrator.find_match(1, CancellationToken::new()).await);
    let one_two = expect_paired(orchestrator.find_match(2, CancellationToken::new()).await);
    let third = expect_pending(orchestrator.find_match(3, CancellationToken::new()).await);
    let three_four = expect_paired(orchestrator.find_match(4, CancellationToken::new()).await);

    assert_eq!(first.wait().await, Ok(one_two));
    assert_eq!(third.wait().await, Ok(three_four));

    let pairs: Vec<_> = system
        .sessions
        .sessions()
        .into_iter()
        .map(|s| (s.requester, s.partner))
        .collect();
    assert_eq!(pairs, vec![(2, 1), (4, 3)]);
    assert!(system.store.snapshot().is_empty());
}

#[tokio::test]
async fn test_oldest_waiters_are_served_first() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    // Waiters 1, 2 and 3 queued in that order, e.g. by other instances
    let mut waiting = Vec::new();
    for user_id in [1, 2, 3] {
        let ticket = WaitingTicket::new(user_id);
        waiting.push(system.registry.register(&ticket).unwrap());
        system.store.enqueue(&ticket).await.unwrap();
    }

    let first_session = expect_paired(orchestrator.find_match(10, CancellationToken::new()).await);
    let second_session = expect_paired(orchestrator.find_match(11, CancellationToken::new()).await);

    let pairs: Vec<_> = system
        .sessions
        .sessions()
        .into_iter()
        .map(|s| (s.requester, s.partner))
        .collect();
    assert_eq!(pairs, vec![(10, 1), (11, 2)]);
    assert_eq!(system.store.snapshot(), vec![3]);

    let mut third = waiting.pop().unwrap();
    let second = waiting.pop().unwrap();
    let first = waiting.pop().unwrap();
    assert_eq!(first.await.unwrap(), Ok(first_session));
    assert_eq!(second.await.unwrap(), Ok(second_session));
    assert!(third.try_recv().is_err());
}

#[tokio::test]
async fn test_repeat_request_is_rejected_without_self_pairing() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    let _pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);

    let repeat = orchestrator.find_match(7, CancellationToken::new()).await;
    assert!(matches!(
        repeat,
        Err(MatchmakingError::AlreadyQueued { user_id: 7 })
    ));

    assert_eq!(system.store.snapshot(), vec![7]);
    assert!(system.sessions.sessions().is_empty());
    assert_eq!(orchestrator.stats().rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_after_budget_and_not_before() {
    let budget = Duration::from_secs(30);
    let system = create_test_system(test_config(budget));
    let orchestrator = system.orchestrator.clone();

    let started = Instant::now();
    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);
    let wait = tokio::spawn(pending.wait());

    tokio::time::sleep(budget - Duration::from_secs(1)).await;
    assert!(!wait.is_finished());

    assert_eq!(wait.await.unwrap(), Err(MatchmakingError::Timeout));
    assert!(started.elapsed() >= budget);

    assert!(system.store.snapshot().is_empty());
    assert!(system.registry.is_empty());

    settle().await;
    assert_eq!(
        system.events.wait_endings_for(7),
        vec![WaitEndReason::Timeout]
    );
    assert_eq!(orchestrator.stats().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_user_is_never_paired_later() {
    let system = create_test_system(test_config(Duration::from_secs(5)));
    let orchestrator = system.orchestrator.clone();

    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);
    assert_eq!(pending.wait().await, Err(MatchmakingError::Timeout));

    // A later caller finds nobody and waits instead
    let late = expect_pending(orchestrator.find_match(9, CancellationToken::new()).await);
    assert_eq!(system.store.snapshot(), vec![9]);
    assert!(system.sessions.sessions().is_empty());
    drop(late);
}

#[tokio::test]
async fn test_cancellation_is_clean() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    let cancel = CancellationToken::new();
    let pending = expect_pending(orchestrator.find_match(7, cancel.clone()).await);
    cancel.cancel();

    assert_eq!(pending.wait().await, Err(MatchmakingError::Cancelled));
    assert!(system.store.snapshot().is_empty());
    assert!(system.registry.is_empty());

    // The next caller does not get the cancelled user
    let next = expect_pending(orchestrator.find_match(9, CancellationToken::new()).await);
    assert!(system.sessions.sessions().is_empty());

    // And the cancelled user may come back straight away
    let chat_session_id = expect_paired(orchestrator.find_match(7, CancellationToken::new()).await);
    assert_eq!(next.wait().await, Ok(chat_session_id));
    assert_eq!(
        system
            .sessions
            .sessions()
            .iter()
            .map(|s| (s.requester, s.partner))
            .collect::<Vec<_>>(),
        vec![(7, 9)]
    );

    settle().await;
    assert_eq!(
        system.events.wait_endings_for(7)[0],
        WaitEndReason::Cancelled
    );
}

#[tokio::test]
async fn test_dropping_pending_match_cancels_wait() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);
    drop(pending);

    // The supervisor cleans up on its own task
    for _ in 0..100 {
        if system.store.snapshot().is_empty() && system.registry.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(system.store.snapshot().is_empty());
    assert!(system.registry.is_empty());
}

#[tokio::test]
async fn test_session_failure_fails_both_users() {
    let system = create_test_system_with(
        test_config(Duration::from_secs(30)),
        RecordingSessionCreator::failing(1),
    );
    let orchestrator = system.orchestrator.clone();

    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);

    let second = orchestrator.find_match(9, CancellationToken::new()).await;
    assert!(matches!(
        second,
        Err(MatchmakingError::PairingFailed { .. })
    ));
    assert!(matches!(
        pending.wait().await,
        Err(MatchmakingError::PairingFailed { .. })
    ));

    // Neither user is left behind, and both may try again
    assert!(system.store.snapshot().is_empty());
    assert!(system.registry.is_empty());

    let retry = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);
    let chat_session_id = expect_paired(orchestrator.find_match(9, CancellationToken::new()).await);
    assert_eq!(retry.wait().await, Ok(chat_session_id));

    settle().await;
    assert_eq!(system.events.wait_endings_for(7), vec![WaitEndReason::Failed]);
    assert_eq!(orchestrator.stats().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_partner_timing_out_during_session_creation_fails_requester() {
    let config = PairingConfig {
        wait_timeout: Duration::from_secs(1),
        stale_after: Duration::from_secs(2),
        pairing_grace: Duration::from_millis(100),
    };
    let system =
        create_test_system_with(config, RecordingSessionCreator::slow(Duration::from_millis(500)));
    let orchestrator = system.orchestrator.clone();

    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);
    let waiting = tokio::spawn(pending.wait());

    // User 9 pops user 7 just before the budget runs out; the session takes
    // longer than the remaining budget plus grace
    tokio::time::sleep(Duration::from_millis(900)).await;
    let requester = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.find_match(9, CancellationToken::new()).await }
    });

    assert_eq!(waiting.await.unwrap(), Err(MatchmakingError::Timeout));
    assert!(matches!(
        requester.await.unwrap(),
        Err(MatchmakingError::PairingFailed { .. })
    ));

    // Neither side is told about the orphaned session
    assert_eq!(system.sessions.sessions().len(), 1);
    assert!(system.registry.is_empty());
    assert!(system.store.snapshot().is_empty());

    settle().await;
    assert_eq!(system.events.wait_endings_for(7), vec![WaitEndReason::Timeout]);
    assert_eq!(system.events.wait_endings_for(9), vec![WaitEndReason::Failed]);
    assert!(system
        .events
        .get_published_events()
        .iter()
        .all(|e| !matches!(e, AmqpMessage::PairingCompleted(_))));
}

#[tokio::test]
async fn test_stale_sweep_only_removes_orphans() {
    let system = create_test_system(test_config(Duration::from_secs(30)));
    let orchestrator = system.orchestrator.clone();

    let pending = expect_pending(orchestrator.find_match(7, CancellationToken::new()).await);

    assert_eq!(orchestrator.sweep_stale_tickets().await.unwrap(), 0);
    assert_eq!(system.store.snapshot(), vec![7]);
    drop(pending);
}
