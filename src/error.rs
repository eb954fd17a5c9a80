//! Error types for the pairing service
//!
//! The pairing core reports typed terminal outcomes through [`MatchmakingError`]
//! so that callers can tell a timeout from a store failure. Service glue
//! (startup, configuration, servers) uses anyhow like the rest of the binary.

use crate::types::UserId;

/// Result type alias for service glue
pub type Result<T> = anyhow::Result<T>;

/// Result type alias for the pairing core
pub type PairingResult<T> = std::result::Result<T, MatchmakingError>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchmakingError {
    #[error("User {user_id} is already queued")]
    AlreadyQueued { user_id: UserId },

    #[error("User {user_id} already has a pending match request")]
    AlreadyRegistered { user_id: UserId },

    #[error("Queue store error: {message}")]
    StoreError { message: String },

    #[error("Session creation failed: {message}")]
    SessionCreationError { message: String },

    #[error("Pairing failed: {reason}")]
    PairingFailed { reason: String },

    #[error("No partner found within the wait budget")]
    Timeout,

    #[error("Matchmaking request was cancelled")]
    Cancelled,

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Short machine-readable label, used for metrics and event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            MatchmakingError::AlreadyQueued { .. } => "already_queued",
            MatchmakingError::AlreadyRegistered { .. } => "already_registered",
            MatchmakingError::StoreError { .. } => "store_error",
            MatchmakingError::SessionCreationError { .. } => "session_creation_error",
            MatchmakingError::PairingFailed { .. } => "pairing_failed",
            MatchmakingError::Timeout => "timeout",
            MatchmakingError::Cancelled => "cancelled",
            MatchmakingError::AmqpConnectionFailed { .. } => "amqp_connection_failed",
            MatchmakingError::ConfigurationError { .. } => "configuration_error",
            MatchmakingError::InternalError { .. } => "internal_error",
        }
    }
}

impl From<redis::RedisError> for MatchmakingError {
    fn from(err: redis::RedisError) -> Self {
        MatchmakingError::StoreError {
            message: err.to_string(),
        }
    }
}
