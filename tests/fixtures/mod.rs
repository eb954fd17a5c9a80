//! Test fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use rendezvous::amqp::publisher::MockEventPublisher;
use rendezvous::error::{MatchmakingError, PairingResult};
use rendezvous::metrics::MetricsCollector;
use rendezvous::pairing::{
    LocalMatchNotifier, MatchOutcome, PairingConfig, PairingOrchestrator, PendingMatch,
    SubscriberRegistry,
};
use rendezvous::queue::InMemoryQueueStore;
use rendezvous::session::SessionCreator;
use rendezvous::types::{ChatSessionId, UserId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One session the creator was asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub chat_session_id: ChatSessionId,
    pub requester: UserId,
    pub partner: UserId,
}

/// Session creator that records every call and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingSessionCreator {
    sessions: Mutex<Vec<CreatedSession>>,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingSessionCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with `SessionCreationError`
    pub fn failing(count: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(count),
            ..Self::default()
        }
    }

    /// Take `delay` before answering, to widen race windows
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn sessions(&self) -> Vec<CreatedSession> {
        self.sessions
            .lock()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionCreator for RecordingSessionCreator {
    async fn create_session(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> PairingResult<ChatSessionId> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(MatchmakingError::SessionCreationError {
                message: "chat service unavailable".to_string(),
            });
        }

        let session = CreatedSession {
            chat_session_id: format!("chat-{}-{}", user_a, user_b),
            requester: user_a,
            partner: user_b,
        };
        let id = session.chat_session_id.clone();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(session);
        }
        Ok(id)
    }
}

/// A complete single-instance pairing engine with observable backends
pub struct TestSystem {
    pub orchestrator: Arc<PairingOrchestrator>,
    pub store: Arc<InMemoryQueueStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub sessions: Arc<RecordingSessionCreator>,
    pub events: Arc<MockEventPublisher>,
}

pub fn test_config(wait_timeout: Duration) -> PairingConfig {
    PairingConfig {
        wait_timeout,
        stale_after: wait_timeout * 2,
        pairing_grace: Duration::from_millis(500),
    }
}

pub fn create_test_system(config: PairingConfig) -> TestSystem {
    create_test_system_with(config, RecordingSessionCreator::new())
}

pub fn create_test_system_with(
    config: PairingConfig,
    sessions: RecordingSessionCreator,
) -> TestSystem {
    let store = Arc::new(InMemoryQueueStore::new());
    let registry = Arc::new(SubscriberRegistry::new());
    let sessions = Arc::new(sessions);
    let events = Arc::new(MockEventPublisher::new());
    let metrics = Arc::new(MetricsCollector::new().expect("metrics collector"));

    let orchestrator = PairingOrchestrator::new(
        store.clone(),
        registry.clone(),
        Arc::new(LocalMatchNotifier::new(registry.clone())),
        sessions.clone(),
        events.clone(),
        metrics,
        config,
    );

    TestSystem {
        orchestrator: Arc::new(orchestrator),
        store,
        registry,
        sessions,
        events,
    }
}

/// Unwrap a `find_match` result that is expected to wait
pub fn expect_pending(outcome: PairingResult<MatchOutcome>) -> PendingMatch {
    match outcome {
        Ok(MatchOutcome::Pending(pending)) => pending,
        other => panic!("expected caller to wait, got {:?}", other),
    }
}

/// Unwrap a `find_match` result that is expected to pair on arrival
pub fn expect_paired(outcome: PairingResult<MatchOutcome>) -> ChatSessionId {
    match outcome {
        Ok(MatchOutcome::Paired(chat_session_id)) => chat_session_id,
        other => panic!("expected caller to pair, got {:?}", other),
    }
}

/// Let spawned event publications run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
