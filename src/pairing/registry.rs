//! Per-instance registry of completion handles for in-flight `find_match` calls
//!
//! Every operation is a short O(1) critical section under one mutex. The
//! mutex is never held across an `.await`, so no external call can run while
//! it is locked.

use crate::error::{MatchmakingError, PairingResult};
use crate::types::{PairingOutcome, TicketId, UserId, WaitingTicket};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Single-write slot a waiting caller receives its outcome through
pub type CompletionHandle = oneshot::Sender<PairingOutcome>;

/// Receiving side of a [`CompletionHandle`]
pub type CompletionReceiver = oneshot::Receiver<PairingOutcome>;

struct Subscriber {
    ticket_id: TicketId,
    handle: CompletionHandle,
}

/// Map from waiting user to the handle of their current attempt
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<UserId, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Subscriber>> {
        // A panic while holding this lock leaves the map consistent (every
        // critical section is a single insert/remove), so poisoning is ignored.
        self.subscribers.lock().unwrap_or_else(|poisoned| {
            error!("Subscriber registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Create a fresh handle for `ticket` and return its receiving side.
    ///
    /// Fails with `AlreadyRegistered` if the user already has a live entry.
    pub fn register(&self, ticket: &WaitingTicket) -> PairingResult<CompletionReceiver> {
        let (handle, receiver) = oneshot::channel();
        let mut subscribers = self.lock();

        if subscribers.contains_key(&ticket.user_id) {
            return Err(MatchmakingError::AlreadyRegistered {
                user_id: ticket.user_id,
            });
        }

        subscribers.insert(
            ticket.user_id,
            Subscriber {
                ticket_id: ticket.ticket_id,
                handle,
            },
        );
        debug!(
            "Registered ticket {} for user {}",
            ticket.ticket_id, ticket.user_id
        );
        Ok(receiver)
    }

    /// Write `outcome` to the user's handle and drop the entry.
    ///
    /// Returns false, without touching anything, when there is no entry or the
    /// entry belongs to another ticket. Never writes a handle twice.
    pub fn resolve(&self, user_id: UserId, ticket_id: TicketId, outcome: PairingOutcome) -> bool {
        let subscriber = {
            let mut subscribers = self.lock();
            match subscribers.get(&user_id) {
                Some(entry) if entry.ticket_id == ticket_id => subscribers.remove(&user_id),
                _ => None,
            }
        };

        match subscriber {
            Some(subscriber) => {
                if subscriber.handle.send(outcome).is_err() {
                    debug!(
                        "Receiver for user {} ticket {} already dropped",
                        user_id, ticket_id
                    );
                }
                true
            }
            None => {
                debug!(
                    "No live handle for user {} ticket {}, resolve skipped",
                    user_id, ticket_id
                );
                false
            }
        }
    }

    /// Remove the entry without resolving it.
    ///
    /// The unwritten handle is returned so the caller can report a terminal
    /// outcome through it; dropping it closes the receiver instead.
    pub fn withdraw(&self, user_id: UserId, ticket_id: TicketId) -> Option<CompletionHandle> {
        let mut subscribers = self.lock();
        match subscribers.get(&user_id) {
            Some(entry) if entry.ticket_id == ticket_id => {
                subscribers.remove(&user_id).map(|s| s.handle)
            }
            _ => None,
        }
    }

    /// Whether the user has any live entry
    pub fn is_registered(&self, user_id: UserId) -> bool {
        self.lock().contains_key(&user_id)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
