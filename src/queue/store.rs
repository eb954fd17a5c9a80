//! Queue store trait shared by every backend

use crate::error::PairingResult;
use crate::types::{UserId, WaitingTicket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of one atomic match attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchAttempt {
    /// A partner ticket was popped and is now owned by the caller
    Partner(WaitingTicket),
    /// Queue empty, or the head was the caller's own ticket
    NoPartner,
}

/// Result of one atomic match-or-enqueue step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// A partner ticket was popped and is now owned by the caller
    Partner(WaitingTicket),
    /// Nobody to pair with; the caller's ticket is now at the tail
    Queued,
}

/// FIFO of waiting tickets shared by all service instances.
///
/// Every mutation must be atomic with respect to every other caller,
/// including callers in other processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a ticket to the tail.
    ///
    /// Fails with `AlreadyQueued` when the user already holds a ticket.
    async fn enqueue(&self, ticket: &WaitingTicket) -> PairingResult<()>;

    /// Pop the head and hand it out as a partner, unless it belongs to
    /// `self_id`, in which case it goes back to the tail.
    ///
    /// Tickets enqueued before `stale_before` are discarded in the same step.
    async fn atomic_match_or_noop(
        &self,
        self_id: UserId,
        stale_before: DateTime<Utc>,
    ) -> PairingResult<MatchAttempt>;

    /// `atomic_match_or_noop` followed by `enqueue` on no partner, as one
    /// indivisible step. Two callers arriving together therefore pair with
    /// each other instead of both queueing.
    ///
    /// Fails with `AlreadyQueued`, without popping anything, when the user
    /// already holds a ticket.
    async fn match_or_enqueue(
        &self,
        ticket: &WaitingTicket,
        stale_before: DateTime<Utc>,
    ) -> PairingResult<Arrival>;

    /// Remove a ticket if it is still queued. Absence is not an error.
    async fn remove(&self, ticket: &WaitingTicket) -> PairingResult<bool>;

    /// Whether the user currently holds a ticket
    async fn contains(&self, user_id: UserId) -> PairingResult<bool>;

    /// Number of queued tickets
    async fn len(&self) -> PairingResult<usize>;

    /// Drop every ticket enqueued before `cutoff`, returning how many went
    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> PairingResult<usize>;

    /// Cheap connectivity probe for health checks
    async fn ping(&self) -> PairingResult<()>;

    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;
}
