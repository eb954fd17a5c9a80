//! In-process queue store for single-instance deployments and tests

use crate::error::{MatchmakingError, PairingResult};
use crate::queue::store::{Arrival, MatchAttempt, QueueStore};
use crate::types::{UserId, WaitingTicket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Queue store backed by a `VecDeque`.
///
/// Each operation runs under one mutex, which gives the same atomicity the
/// Redis scripts give, but only within this process.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    queue: Mutex<VecDeque<WaitingTicket>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of queued user ids, head first (for testing)
    pub fn snapshot(&self) -> Vec<UserId> {
        self.queue
            .lock()
            .map(|queue| queue.iter().map(|t| t.user_id).collect())
            .unwrap_or_default()
    }

    /// Pop heads until a live partner turns up. The caller's own ticket goes
    /// back to the tail and ends the search; stale heads are dropped.
    fn pop_partner(
        queue: &mut VecDeque<WaitingTicket>,
        self_id: UserId,
        stale_before: DateTime<Utc>,
    ) -> Option<WaitingTicket> {
        while let Some(head) = queue.pop_front() {
            if head.user_id == self_id {
                queue.push_back(head);
                return None;
            }
            if head.enqueued_at >= stale_before {
                return Some(head);
            }
        }
        None
    }

    fn lock(&self) -> PairingResult<std::sync::MutexGuard<'_, VecDeque<WaitingTicket>>> {
        self.queue.lock().map_err(|_| MatchmakingError::InternalError {
            message: "Failed to acquire queue lock".to_string(),
        })
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, ticket: &WaitingTicket) -> PairingResult<()> {
        let mut queue = self.lock()?;
        if queue.iter().any(|t| t.user_id == ticket.user_id) {
            return Err(MatchmakingError::AlreadyQueued {
                user_id: ticket.user_id,
            });
        }
        queue.push_back(ticket.clone());
        Ok(())
    }

    async fn atomic_match_or_noop(
        &self,
        self_id: UserId,
        stale_before: DateTime<Utc>,
    ) -> PairingResult<MatchAttempt> {
        let mut queue = self.lock()?;
        Ok(match Self::pop_partner(&mut queue, self_id, stale_before) {
            Some(partner) => MatchAttempt::Partner(partner),
            None => MatchAttempt::NoPartner,
        })
    }

    async fn match_or_enqueue(
        &self,
        ticket: &WaitingTicket,
        stale_before: DateTime<Utc>,
    ) -> PairingResult<Arrival> {
        let mut queue = self.lock()?;
        if queue.iter().any(|t| t.user_id == ticket.user_id) {
            return Err(MatchmakingError::AlreadyQueued {
                user_id: ticket.user_id,
            });
        }

        match Self::pop_partner(&mut queue, ticket.user_id, stale_before) {
            Some(partner) => Ok(Arrival::Partner(partner)),
            None => {
                queue.push_back(ticket.clone());
                Ok(Arrival::Queued)
            }
        }
    }

    async fn remove(&self, ticket: &WaitingTicket) -> PairingResult<bool> {
        let mut queue = self.lock()?;
        match queue.iter().position(|t| t.ticket_id == ticket.ticket_id) {
            Some(index) => {
                queue.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn contains(&self, user_id: UserId) -> PairingResult<bool> {
        Ok(self.lock()?.iter().any(|t| t.user_id == user_id))
    }

    async fn len(&self) -> PairingResult<usize> {
        Ok(self.lock()?.len())
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> PairingResult<usize> {
        let mut queue = self.lock()?;
        let before = queue.len();
        queue.retain(|t| t.enqueued_at >= cutoff);
        Ok(before - queue.len())
    }

    async fn ping(&self) -> PairingResult<()> {
        self.lock().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
