//! The caller's side of a queued `find_match`

use crate::error::MatchmakingError;
use crate::pairing::registry::CompletionReceiver;
use crate::types::{PairingOutcome, UserId, WaitingTicket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A wait in progress.
///
/// [`PendingMatch::wait`] resolves exactly once with a chat session id, or
/// with `Timeout`, `Cancelled` or `PairingFailed`. Dropping it before it
/// resolves cancels the wait and the ticket leaves the queue.
#[derive(Debug)]
pub struct PendingMatch {
    ticket: WaitingTicket,
    receiver: CompletionReceiver,
    cancel: CancellationToken,
    settled: CancellationToken,
}

impl PendingMatch {
    pub(crate) fn new(
        ticket: WaitingTicket,
        receiver: CompletionReceiver,
        cancel: CancellationToken,
        settled: CancellationToken,
    ) -> Self {
        Self {
            ticket,
            receiver,
            cancel,
            settled,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.ticket.user_id
    }

    pub fn ticket(&self) -> &WaitingTicket {
        &self.ticket
    }

    /// Ask for the wait to end. A pairing that already won still comes through.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Suspend until the outcome arrives
    pub async fn wait(mut self) -> PairingOutcome {
        let outcome = match (&mut self.receiver).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(
                    "Completion handle for user {} closed without an outcome",
                    self.ticket.user_id
                );
                Err(MatchmakingError::Cancelled)
            }
        };
        self.settled.cancel();
        outcome
    }
}

impl Drop for PendingMatch {
    fn drop(&mut self) {
        if !self.settled.is_cancelled() {
            self.cancel.cancel();
        }
    }
}
