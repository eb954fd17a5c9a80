//! The `find_match` operation
//!
//! Composes the queue store, subscriber registry, timeout supervisor, match
//! notifier and session creator. Each call either pairs the caller with the
//! oldest waiting user right away or leaves the caller waiting on a
//! [`PendingMatch`].

use crate::amqp::publisher::EventPublisher;
use crate::error::{MatchmakingError, PairingResult};
use crate::metrics::MetricsCollector;
use crate::pairing::notifier::{Delivery, MatchNotifier};
use crate::pairing::pending::PendingMatch;
use crate::pairing::registry::{CompletionReceiver, SubscriberRegistry};
use crate::pairing::stats::{PairingStats, StatsTracker};
use crate::pairing::supervisor::TimeoutSupervisor;
use crate::queue::{Arrival, QueueStore};
use crate::session::SessionCreator;
use crate::types::{
    ChatSessionId, MatchNotice, PairingCompleted, UserId, WaitEndReason, WaitEnded, WaitingTicket,
};
use crate::utils::{current_timestamp, cutoff_before, elapsed_since};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing knobs for the pairing engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    /// How long a caller may wait for a partner
    pub wait_timeout: Duration,
    /// Tickets older than this are treated as orphans and never handed out
    pub stale_after: Duration,
    /// Extra time a timed-out ticket gets when a partner is already pairing it
    pub pairing_grace: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            pairing_grace: Duration::from_secs(5),
        }
    }
}

/// What `find_match` returns when it does not fail outright
#[derive(Debug)]
pub enum MatchOutcome {
    /// Paired on arrival
    Paired(ChatSessionId),
    /// Queued; await the pending match for the outcome
    Pending(PendingMatch),
}

/// Pairing engine entry point
pub struct PairingOrchestrator {
    store: Arc<dyn QueueStore>,
    registry: Arc<SubscriberRegistry>,
    notifier: Arc<dyn MatchNotifier>,
    session_creator: Arc<dyn SessionCreator>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
    stats: Arc<StatsTracker>,
    supervisor: TimeoutSupervisor,
    config: PairingConfig,
}

impl PairingOrchestrator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<SubscriberRegistry>,
        notifier: Arc<dyn MatchNotifier>,
        session_creator: Arc<dyn SessionCreator>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
        config: PairingConfig,
    ) -> Self {
        let stats = Arc::new(StatsTracker::new());
        let supervisor = TimeoutSupervisor::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            metrics.clone(),
            stats.clone(),
            config.pairing_grace,
        );

        Self {
            store,
            registry,
            notifier,
            session_creator,
            events,
            metrics,
            stats,
            supervisor,
            config,
        }
    }

    /// Find a partner for `user_id`.
    ///
    /// Cancelling `cancel` (or dropping the returned [`PendingMatch`]) ends a
    /// wait with `Cancelled`. Once a partner has been popped the call is not
    /// cancel-safe: dropping the future mid-way loses that partner's wait, so
    /// callers that may be dropped should run it on its own task.
    pub async fn find_match(
        &self,
        user_id: UserId,
        cancel: CancellationToken,
    ) -> PairingResult<MatchOutcome> {
        let start_time = Instant::now();
        self.stats.record(|s| s.requests += 1);

        let result = self.try_find_match(user_id, cancel).await;

        let outcome = match &result {
            Ok(MatchOutcome::Paired(_)) => "paired",
            Ok(MatchOutcome::Pending(_)) => "queued",
            Err(MatchmakingError::AlreadyQueued { .. }) => "rejected",
            Err(MatchmakingError::PairingFailed { .. }) => "failed",
            Err(_) => "error",
        };
        self.metrics.record_request(outcome, start_time.elapsed());

        debug!(
            "find_match for user {} returned {} in {:.2}ms",
            user_id,
            outcome,
            start_time.elapsed().as_secs_f64() * 1000.0
        );
        result
    }

    async fn try_find_match(
        &self,
        user_id: UserId,
        cancel: CancellationToken,
    ) -> PairingResult<MatchOutcome> {
        if self.registry.is_registered(user_id) || self.store.contains(user_id).await? {
            self.stats.record(|s| s.rejected += 1);
            return Err(MatchmakingError::AlreadyQueued { user_id });
        }

        let ticket = WaitingTicket::new(user_id);
        let receiver = self.registry.register(&ticket).map_err(|e| match e {
            MatchmakingError::AlreadyRegistered { user_id } => {
                self.stats.record(|s| s.rejected += 1);
                MatchmakingError::AlreadyQueued { user_id }
            }
            other => other,
        })?;

        // Match and enqueue happen in one store step, so two callers
        // arriving together cannot both end up queued.
        let stale_before = cutoff_before(self.config.stale_after);
        let arrival = match self.store.match_or_enqueue(&ticket, stale_before).await {
            Ok(arrival) => arrival,
            Err(e) => {
                self.registry.withdraw(user_id, ticket.ticket_id);
                if matches!(e, MatchmakingError::AlreadyQueued { .. }) {
                    self.stats.record(|s| s.rejected += 1);
                }
                return Err(e);
            }
        };

        match arrival {
            Arrival::Queued => Ok(self.wait_for_partner(ticket, receiver, cancel)),
            Arrival::Partner(partner) => self.pair_with(ticket, partner).await,
        }
    }

    fn wait_for_partner(
        &self,
        ticket: WaitingTicket,
        receiver: CompletionReceiver,
        cancel: CancellationToken,
    ) -> MatchOutcome {
        let wait_cancel = cancel.child_token();
        let settled = CancellationToken::new();
        self.supervisor.arm(
            ticket.clone(),
            self.config.wait_timeout,
            wait_cancel.clone(),
            settled.clone(),
        );

        self.stats.record(|s| s.queued += 1);
        info!(
            "User {} queued with ticket {}, waiting up to {:?}",
            ticket.user_id, ticket.ticket_id, self.config.wait_timeout
        );

        MatchOutcome::Pending(PendingMatch::new(ticket, receiver, wait_cancel, settled))
    }

    async fn pair_with(
        &self,
        ticket: WaitingTicket,
        partner: WaitingTicket,
    ) -> PairingResult<MatchOutcome> {
        let session_start = Instant::now();
        let created = self
            .session_creator
            .create_session(ticket.user_id, partner.user_id)
            .await;
        self.metrics
            .record_session_creation(created.is_ok(), session_start.elapsed());

        match created {
            Ok(chat_session_id) => {
                let delivered = self
                    .notify_partner(
                        &partner,
                        MatchNotice::Paired {
                            chat_session_id: chat_session_id.clone(),
                        },
                    )
                    .await;
                if !delivered {
                    return Err(self.abandon_pairing(&ticket, &partner, &chat_session_id));
                }

                self.registry
                    .resolve(ticket.user_id, ticket.ticket_id, Ok(chat_session_id.clone()));

                let partner_waited = elapsed_since(partner.enqueued_at);
                self.metrics.record_pairing(partner_waited);
                self.stats.record(|s| {
                    s.immediate_pairings += 1;
                    s.paired_while_waiting += 1;
                });
                info!(
                    "Paired users {} and {} in chat session {} (partner waited {:.2}s)",
                    ticket.user_id,
                    partner.user_id,
                    chat_session_id,
                    partner_waited.as_secs_f64()
                );

                self.spawn_pairing_completed(PairingCompleted {
                    chat_session_id: chat_session_id.clone(),
                    requester_id: ticket.user_id,
                    partner_id: partner.user_id,
                    timestamp: current_timestamp(),
                });

                Ok(MatchOutcome::Paired(chat_session_id))
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    "Session creation for users {} and {} failed: {}",
                    ticket.user_id, partner.user_id, reason
                );

                self.notify_partner(
                    &partner,
                    MatchNotice::Failed {
                        reason: reason.clone(),
                    },
                )
                .await;
                self.registry.withdraw(ticket.user_id, ticket.ticket_id);
                self.stats.record(|s| s.failures += 1);

                self.spawn_wait_ended(WaitEnded {
                    user_id: partner.user_id,
                    ticket_id: partner.ticket_id,
                    reason: WaitEndReason::Failed,
                    waited_ms: elapsed_since(partner.enqueued_at).as_millis() as u64,
                    timestamp: current_timestamp(),
                });

                Err(MatchmakingError::PairingFailed { reason })
            }
        }
    }

    /// Send `notice` to the partner's handle. Returns false when it is known
    /// not to have arrived.
    async fn notify_partner(&self, partner: &WaitingTicket, notice: MatchNotice) -> bool {
        match self.notifier.notify(partner, notice).await {
            Ok(delivery) => {
                self.metrics.record_notification(delivery.as_str());
                debug!(
                    "Notice for user {} delivered via {}",
                    partner.user_id,
                    delivery.as_str()
                );
                delivery != Delivery::Dropped
            }
            Err(e) => {
                self.metrics.record_notification("failed");
                error!(
                    "Failed to notify user {} (ticket {}): {}",
                    partner.user_id, partner.ticket_id, e
                );
                false
            }
        }
    }

    /// The partner's wait ended (timeout or cancellation) while the session
    /// was being created. The requester must not be told it was paired.
    fn abandon_pairing(
        &self,
        ticket: &WaitingTicket,
        partner: &WaitingTicket,
        chat_session_id: &ChatSessionId,
    ) -> MatchmakingError {
        warn!(
            "User {} left before chat session {} with user {} was ready, abandoning it",
            partner.user_id, chat_session_id, ticket.user_id
        );
        self.registry.withdraw(ticket.user_id, ticket.ticket_id);
        self.stats.record(|s| s.failures += 1);

        self.spawn_wait_ended(WaitEnded {
            user_id: ticket.user_id,
            ticket_id: ticket.ticket_id,
            reason: WaitEndReason::Failed,
            waited_ms: elapsed_since(ticket.enqueued_at).as_millis() as u64,
            timestamp: current_timestamp(),
        });

        MatchmakingError::PairingFailed {
            reason: format!("partner {} is no longer waiting", partner.user_id),
        }
    }

    fn spawn_pairing_completed(&self, event: PairingCompleted) {
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let start_time = Instant::now();
            let result = events.publish_pairing_completed(event).await;
            metrics.record_amqp_operation(
                "pairing_completed",
                result.is_ok(),
                start_time.elapsed(),
            );
            if let Err(e) = result {
                warn!("Failed to publish pairing completed event: {}", e);
            }
        });
    }

    fn spawn_wait_ended(&self, event: WaitEnded) {
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let start_time = Instant::now();
            let result = events.publish_wait_ended(event).await;
            metrics.record_amqp_operation("wait_ended", result.is_ok(), start_time.elapsed());
            if let Err(e) = result {
                warn!("Failed to publish wait ended event: {}", e);
            }
        });
    }

    /// Purge tickets older than the staleness cutoff from the shared queue
    pub async fn sweep_stale_tickets(&self) -> PairingResult<usize> {
        let purged = self
            .store
            .purge_stale(cutoff_before(self.config.stale_after))
            .await?;
        if purged > 0 {
            self.metrics.record_stale_purged(purged);
        }
        Ok(purged)
    }

    /// Current counters, with the live waiting count filled in
    pub fn stats(&self) -> PairingStats {
        let mut stats = self.stats.snapshot();
        stats.players_waiting = self.registry.len();
        stats
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::pairing::notifier::LocalMatchNotifier;
    use crate::queue::store::MockQueueStore;
    use crate::queue::InMemoryQueueStore;
    use crate::session::{LocalSessionCreator, MockSessionCreator};
    use crate::types::AmqpMessage;
    use mockall::predicate::eq;

    struct Fixture {
        orchestrator: PairingOrchestrator,
        store: Arc<InMemoryQueueStore>,
        events: Arc<MockEventPublisher>,
    }

    fn create_test_orchestrator(session_creator: Arc<dyn SessionCreator>) -> Fixture {
        let store = Arc::new(InMemoryQueueStore::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let events = Arc::new(MockEventPublisher::new());
        let orchestrator = PairingOrchestrator::new(
            store.clone(),
            registry.clone(),
            Arc::new(LocalMatchNotifier::new(registry)),
            session_creator,
            events.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
            PairingConfig::default(),
        );

        Fixture {
            orchestrator,
            store,
            events,
        }
    }

    async fn queue_user(fx: &Fixture, user_id: UserId) -> PendingMatch {
        match fx
            .orchestrator
            .find_match(user_id, CancellationToken::new())
            .await
            .unwrap()
        {
            MatchOutcome::Pending(pending) => pending,
            MatchOutcome::Paired(id) => panic!("user {} unexpectedly paired into {}", user_id, id),
        }
    }

    #[tokio::test]
    async fn test_second_caller_pairs_with_first() {
        let mut creator = MockSessionCreator::new();
        creator
            .expect_create_session()
            .with(eq(9), eq(7))
            .times(1)
            .returning(|_, _| Ok("chat-79".to_string()));
        let fx = create_test_orchestrator(Arc::new(creator));

        let pending = queue_user(&fx, 7).await;
        assert_eq!(fx.store.snapshot(), vec![7]);

        let outcome = fx
            .orchestrator
            .find_match(9, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::Paired(ref id) if id == "chat-79"));
        assert_eq!(pending.wait().await, Ok("chat-79".to_string()));

        assert!(fx.store.snapshot().is_empty());
        assert!(fx.orchestrator.registry().is_empty());

        let stats = fx.orchestrator.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.immediate_pairings, 1);
        assert_eq!(stats.players_waiting, 0);
    }

    #[tokio::test]
    async fn test_repeat_request_is_rejected_not_self_paired() {
        let mut creator = MockSessionCreator::new();
        creator.expect_create_session().never();
        let fx = create_test_orchestrator(Arc::new(creator));

        let _pending = queue_user(&fx, 7).await;
        let err = fx
            .orchestrator
            .find_match(7, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, MatchmakingError::AlreadyQueued { user_id: 7 });
        assert_eq!(fx.store.snapshot(), vec![7]);
        assert_eq!(fx.orchestrator.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_oldest_waiter_is_paired_first() {
        let mut creator = MockSessionCreator::new();
        creator
            .expect_create_session()
            .with(eq(3), eq(1))
            .times(1)
            .returning(|_, _| Ok("chat-31".to_string()));
        let fx = create_test_orchestrator(Arc::new(creator));

        // Two waiters already queued, oldest first
        let registry = fx.orchestrator.registry();
        let mut waiting = Vec::new();
        for user_id in [1, 2] {
            let ticket = WaitingTicket::new(user_id);
            waiting.push(registry.register(&ticket).unwrap());
            fx.store.enqueue(&ticket).await.unwrap();
        }

        let outcome = fx
            .orchestrator
            .find_match(3, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::Paired(ref id) if id == "chat-31"));

        let mut second = waiting.pop().unwrap();
        let first = waiting.pop().unwrap();
        assert_eq!(first.await.unwrap(), Ok("chat-31".to_string()));
        assert!(second.try_recv().is_err());
        assert_eq!(fx.store.snapshot(), vec![2]);
    }

    #[tokio::test]
    async fn test_partner_gone_before_session_ready_fails_requester() {
        let fx = create_test_orchestrator(Arc::new(LocalSessionCreator::new()));

        // Queued but with no live handle: its wait already ended
        fx.store.enqueue(&WaitingTicket::new(7)).await.unwrap();

        let err = fx
            .orchestrator
            .find_match(9, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchmakingError::PairingFailed { .. }));
        assert!(fx.orchestrator.registry().is_empty());
        assert!(fx.store.snapshot().is_empty());
        assert_eq!(fx.orchestrator.stats().failures, 1);

        tokio::task::yield_now().await;
        assert_eq!(fx.events.wait_endings_for(9), vec![WaitEndReason::Failed]);
        assert!(fx
            .events
            .get_published_events()
            .iter()
            .all(|e| !matches!(e, AmqpMessage::PairingCompleted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_caller_times_out() {
        let fx = create_test_orchestrator(Arc::new(LocalSessionCreator::new()));
        let started = tokio::time::Instant::now();

        let pending = queue_user(&fx, 7).await;
        assert_eq!(pending.wait().await, Err(MatchmakingError::Timeout));

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(fx.store.snapshot().is_empty());
        assert!(fx.orchestrator.registry().is_empty());
        assert_eq!(fx.orchestrator.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_cleans_up() {
        let fx = create_test_orchestrator(Arc::new(LocalSessionCreator::new()));
        let cancel = CancellationToken::new();

        let outcome = fx.orchestrator.find_match(7, cancel.clone()).await.unwrap();
        let MatchOutcome::Pending(pending) = outcome else {
            panic!("expected to wait");
        };
        cancel.cancel();

        assert_eq!(pending.wait().await, Err(MatchmakingError::Cancelled));
        assert!(fx.store.snapshot().is_empty());
        assert!(fx.orchestrator.registry().is_empty());

        // Free to try again right away
        let _again = queue_user(&fx, 7).await;
        assert_eq!(fx.store.snapshot(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_wait_leaves_queue() {
        let fx = create_test_orchestrator(Arc::new(LocalSessionCreator::new()));

        let pending = queue_user(&fx, 7).await;
        drop(pending);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(fx.store.snapshot().is_empty());
        assert!(fx.orchestrator.registry().is_empty());

        // Nobody left to pair with: user 9 waits instead of meeting a ghost
        let outcome = fx
            .orchestrator
            .find_match(9, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::Pending(_)));
    }

    #[tokio::test]
    async fn test_session_failure_fails_both_users() {
        let mut creator = MockSessionCreator::new();
        creator
            .expect_create_session()
            .times(1)
            .returning(|_, _| {
                Err(MatchmakingError::SessionCreationError {
                    message: "chat service unavailable".to_string(),
                })
            });
        let fx = create_test_orchestrator(Arc::new(creator));

        let pending = queue_user(&fx, 7).await;
        let err = fx
            .orchestrator
            .find_match(9, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MatchmakingError::PairingFailed { .. }));
        assert!(matches!(
            pending.wait().await,
            Err(MatchmakingError::PairingFailed { .. })
        ));
        assert!(fx.store.snapshot().is_empty());
        assert!(fx.orchestrator.registry().is_empty());
        assert_eq!(fx.orchestrator.stats().failures, 1);

        tokio::task::yield_now().await;
        assert_eq!(fx.events.wait_endings_for(7), vec![WaitEndReason::Failed]);
    }

    #[tokio::test]
    async fn test_pairing_publishes_completed_event() {
        let fx = create_test_orchestrator(Arc::new(LocalSessionCreator::new()));

        let _pending = queue_user(&fx, 7).await;
        fx.orchestrator
            .find_match(9, CancellationToken::new())
            .await
            .unwrap();

        tokio::task::yield_now().await;
        let completed: Vec<_> = fx
            .events
            .get_published_events()
            .into_iter()
            .filter_map(|e| match e {
                AmqpMessage::PairingCompleted(c) => Some((c.requester_id, c.partner_id)),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![(9, 7)]);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_leak_registration() {
        let mut store = MockQueueStore::new();
        store.expect_contains().returning(|_| Ok(false));
        store.expect_match_or_enqueue().returning(|_, _| {
            Err(MatchmakingError::StoreError {
                message: "connection refused".to_string(),
            })
        });

        let registry = Arc::new(SubscriberRegistry::new());
        let orchestrator = PairingOrchestrator::new(
            Arc::new(store),
            registry.clone(),
            Arc::new(LocalMatchNotifier::new(registry.clone())),
            Arc::new(LocalSessionCreator::new()),
            Arc::new(MockEventPublisher::new()),
            Arc::new(MetricsCollector::new().unwrap()),
            PairingConfig::default(),
        );

        let err = orchestrator
            .find_match(7, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchmakingError::StoreError { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_stale_tickets() {
        let fx = create_test_orchestrator(Arc::new(LocalSessionCreator::new()));

        let _live = queue_user(&fx, 5).await;
        let mut orphan = WaitingTicket::new(4);
        orphan.enqueued_at = current_timestamp() - chrono::Duration::seconds(600);
        fx.store.enqueue(&orphan).await.unwrap();

        assert_eq!(fx.orchestrator.sweep_stale_tickets().await.unwrap(), 1);
        assert_eq!(fx.store.snapshot(), vec![5]);
    }
}
