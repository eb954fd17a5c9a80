//! Per-ticket timer that ends a wait on expiry or cancellation
//!
//! Teardown order is always queue first, registry second: once the ticket is
//! out of the queue no other caller can pop it, so withdrawing the handle
//! afterwards cannot strand a partner.

use crate::amqp::publisher::EventPublisher;
use crate::error::MatchmakingError;
use crate::metrics::MetricsCollector;
use crate::pairing::registry::SubscriberRegistry;
use crate::pairing::stats::StatsTracker;
use crate::queue::QueueStore;
use crate::types::{WaitEndReason, WaitEnded, WaitingTicket};
use crate::utils::{current_timestamp, elapsed_since};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawns and runs the wait timers
#[derive(Clone)]
pub struct TimeoutSupervisor {
    store: Arc<dyn QueueStore>,
    registry: Arc<SubscriberRegistry>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
    stats: Arc<StatsTracker>,
    pairing_grace: Duration,
}

impl TimeoutSupervisor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<SubscriberRegistry>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
        stats: Arc<StatsTracker>,
        pairing_grace: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            metrics,
            stats,
            pairing_grace,
        }
    }

    /// Start supervising `ticket`.
    ///
    /// The wait ends with `Timeout` once `budget` elapses or with `Cancelled`
    /// when `cancel` fires, whichever comes first. `settled` marks a wait that
    /// already received its outcome; the timer then exits without touching
    /// anything.
    pub fn arm(
        &self,
        ticket: WaitingTicket,
        budget: Duration,
        cancel: CancellationToken,
        settled: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.supervise(ticket, budget, cancel, settled).await;
        })
    }

    async fn supervise(
        &self,
        ticket: WaitingTicket,
        budget: Duration,
        cancel: CancellationToken,
        settled: CancellationToken,
    ) {
        let mut reason = tokio::select! {
            biased;
            _ = settled.cancelled() => return,
            _ = cancel.cancelled() => WaitEndReason::Cancelled,
            _ = sleep(budget) => WaitEndReason::Timeout,
        };

        let removed = match self.store.remove(&ticket).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(
                    "Failed to remove ticket {} of user {} from the queue: {}",
                    ticket.ticket_id, ticket.user_id, e
                );
                false
            }
        };

        // Not in the queue any more but still registered: a caller popped it
        // and is creating the session right now.
        if reason == WaitEndReason::Timeout
            && !removed
            && self.registry.is_registered(ticket.user_id)
        {
            debug!(
                "Ticket {} of user {} is being paired, holding timeout for up to {:?}",
                ticket.ticket_id, ticket.user_id, self.pairing_grace
            );
            tokio::select! {
                biased;
                _ = settled.cancelled() => return,
                _ = cancel.cancelled() => reason = WaitEndReason::Cancelled,
                _ = sleep(self.pairing_grace) => {}
            }
        }

        let Some(handle) = self.registry.withdraw(ticket.user_id, ticket.ticket_id) else {
            debug!(
                "Ticket {} of user {} already resolved, nothing to withdraw",
                ticket.ticket_id, ticket.user_id
            );
            return;
        };

        let error = match reason {
            WaitEndReason::Timeout => MatchmakingError::Timeout,
            _ => MatchmakingError::Cancelled,
        };
        let _ = handle.send(Err(error));

        let waited = elapsed_since(ticket.enqueued_at);
        info!(
            "Wait ended for user {} - reason: {}, waited: {:.2}s",
            ticket.user_id,
            reason,
            waited.as_secs_f64()
        );

        self.metrics.record_wait_ended(reason, waited);
        self.stats.record(|s| match reason {
            WaitEndReason::Timeout => s.timeouts += 1,
            _ => s.cancellations += 1,
        });

        let event = WaitEnded {
            user_id: ticket.user_id,
            ticket_id: ticket.ticket_id,
            reason,
            waited_ms: waited.as_millis() as u64,
            timestamp: current_timestamp(),
        };
        let start_time = Instant::now();
        let published = self.events.publish_wait_ended(event).await;
        self.metrics
            .record_amqp_operation("wait_ended", published.is_ok(), start_time.elapsed());
        if let Err(e) = published {
            warn!(
                "Failed to publish wait ended event for user {}: {}",
                ticket.user_id, e
            );
        }
    }
}
