//! Rendezvous - pairing microservice for one-to-one chat
//!
//! Users ask to be matched; the first waiting user is paired with the next
//! caller, a chat session is allocated for both, and each caller learns the
//! session id or why no pairing happened. The waiting queue lives in Redis
//! so any number of instances can share it.

pub mod amqp;
pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pairing;
pub mod queue;
pub mod service;
pub mod session;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, PairingResult, Result};
pub use types::*;

// Re-export key components
pub use amqp::publisher::EventPublisher;
pub use pairing::{MatchOutcome, PairingConfig, PairingOrchestrator, PendingMatch};
pub use queue::{InMemoryQueueStore, QueueStore, RedisQueueStore};
pub use session::{LocalSessionCreator, SessionCreator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
