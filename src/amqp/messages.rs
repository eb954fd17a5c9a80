//! AMQP message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::types::*;
use serde_json;

/// Topic exchange for pairing events
pub const EVENTS_EXCHANGE: &str = "rendezvous.events";

/// Queue the chat service consumes session creation requests from
pub const SESSION_REQUEST_QUEUE: &str = "chat.create_session";

/// Routing keys for events
pub const PAIRING_COMPLETED_ROUTING_KEY: &str = "pairing.completed";
pub const WAIT_ENDED_ROUTING_KEY: &str = "wait.ended";

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Get routing key for an event
pub fn routing_key_for(message: &AmqpMessage) -> &'static str {
    match message {
        AmqpMessage::PairingCompleted(_) => PAIRING_COMPLETED_ROUTING_KEY,
        AmqpMessage::WaitEnded(_) => WAIT_ENDED_ROUTING_KEY,
    }
}

/// Serialize a session creation request body
pub fn encode_session_request(request: &CreateSessionRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(request).map_err(|e| {
        MatchmakingError::InternalError {
            message: format!("Failed to serialize session request: {}", e),
        }
        .into()
    })
}

/// Parse a reply from the chat service into a session id
pub fn decode_session_reply(bytes: &[u8]) -> std::result::Result<ChatSessionId, MatchmakingError> {
    let reply: CreateSessionReply =
        serde_json::from_slice(bytes).map_err(|e| MatchmakingError::SessionCreationError {
            message: format!("Malformed session reply: {}", e),
        })?;

    match (reply.chat_session_id, reply.error) {
        (Some(id), None) if !id.is_empty() => Ok(id),
        (_, Some(error)) => Err(MatchmakingError::SessionCreationError { message: error }),
        _ => Err(MatchmakingError::SessionCreationError {
            message: "Session reply carried no session id".to_string(),
        }),
    }
}
