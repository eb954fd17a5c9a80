//! Session Creator seam
//!
//! The chat service owns chat sessions; this service only asks it to allocate
//! one for a freshly paired couple.

pub mod amqp;

use crate::error::PairingResult;
use crate::types::{ChatSessionId, UserId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub use self::amqp::AmqpSessionCreator;

/// Allocates a chat session for two users
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionCreator: Send + Sync {
    /// Create a session for `user_a` and `user_b` and return its id.
    ///
    /// Fails with `SessionCreationError`; failures are never retried here.
    async fn create_session(&self, user_a: UserId, user_b: UserId)
        -> PairingResult<ChatSessionId>;
}

/// Session creator that mints ids locally, for development without a chat service
#[derive(Debug, Default)]
pub struct LocalSessionCreator {
    created: AtomicU64,
}

impl LocalSessionCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions created so far
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionCreator for LocalSessionCreator {
    async fn create_session(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> PairingResult<ChatSessionId> {
        let chat_session_id = uuid::Uuid::new_v4().to_string();
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Minted local chat session {} for users {} and {}",
            chat_session_id, user_a, user_b
        );
        Ok(chat_session_id)
    }
}
