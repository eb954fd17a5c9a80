//! Common types used throughout the pairing service

use crate::error::{MatchmakingError, PairingResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a user asking for a partner
pub type UserId = i64;

/// Unique identifier of one `find_match` attempt
pub type TicketId = Uuid;

/// Opaque chat session identifier minted by the session creator
pub type ChatSessionId = String;

/// A waiting user's entry in the shared queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingTicket {
    pub user_id: UserId,
    pub ticket_id: TicketId,
    pub enqueued_at: DateTime<Utc>,
}

impl WaitingTicket {
    pub fn new(user_id: UserId) -> Self {
        // Millisecond precision, the same resolution the store keeps.
        let now = Utc::now();
        let enqueued_at = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);

        Self {
            user_id,
            ticket_id: Uuid::new_v4(),
            enqueued_at,
        }
    }

    /// Encode as `<user_id>:<ticket_id>:<enqueued_at_millis>`.
    ///
    /// The user id comes first so store-side scripts can compare it with a
    /// plain prefix match.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.user_id,
            self.ticket_id,
            self.enqueued_at.timestamp_millis()
        )
    }

    /// Decode a ticket produced by [`WaitingTicket::encode`]
    pub fn decode(raw: &str) -> PairingResult<Self> {
        let invalid = || MatchmakingError::StoreError {
            message: format!("Malformed ticket in queue: {:?}", raw),
        };

        let mut parts = raw.splitn(3, ':');
        let user_id = parts
            .next()
            .and_then(|p| p.parse::<UserId>().ok())
            .ok_or_else(invalid)?;
        let ticket_id = parts
            .next()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(invalid)?;
        let enqueued_at = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(invalid)?;

        Ok(Self {
            user_id,
            ticket_id,
            enqueued_at,
        })
    }
}

/// Outcome delivered to a waiting user's completion handle
pub type PairingOutcome = PairingResult<ChatSessionId>;

/// Serializable form of a pairing outcome, carried across instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchNotice {
    Paired { chat_session_id: ChatSessionId },
    Failed { reason: String },
}

impl From<MatchNotice> for PairingOutcome {
    fn from(notice: MatchNotice) -> Self {
        match notice {
            MatchNotice::Paired { chat_session_id } => Ok(chat_session_id),
            MatchNotice::Failed { reason } => Err(MatchmakingError::PairingFailed { reason }),
        }
    }
}

/// Message published on a user's notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub user_id: UserId,
    pub ticket_id: TicketId,
    pub notice: MatchNotice,
}

/// Why a wait ended without a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitEndReason {
    Timeout,
    Cancelled,
    Failed,
}

impl std::fmt::Display for WaitEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitEndReason::Timeout => write!(f, "timeout"),
            WaitEndReason::Cancelled => write!(f, "cancelled"),
            WaitEndReason::Failed => write!(f, "failed"),
        }
    }
}

/// AMQP Message Types
/// Event emitted when two users were paired into a chat session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCompleted {
    pub chat_session_id: ChatSessionId,
    pub requester_id: UserId,
    pub partner_id: UserId,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a waiting user left the queue unpaired
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitEnded {
    pub user_id: UserId,
    pub ticket_id: TicketId,
    pub reason: WaitEndReason,
    pub waited_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Request sent to the chat service to allocate a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub user_a: UserId,
    pub user_b: UserId,
}

/// Reply from the chat service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionReply {
    pub chat_session_id: Option<ChatSessionId>,
    pub error: Option<String>,
}

/// Union type for all AMQP messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AmqpMessage {
    PairingCompleted(PairingCompleted),
    WaitEnded(WaitEnded),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ticket_encoding_layout() {
        let ticket = WaitingTicket::new(7);
        let encoded = ticket.encode();

        assert!(encoded.starts_with("7:"));
        assert_eq!(encoded.matches(':').count(), 2);
    }

    #[test]
    fn test_ticket_decode_rejects_garbage() {
        assert!(WaitingTicket::decode("").is_err());
        assert!(WaitingTicket::decode("7").is_err());
        assert!(WaitingTicket::decode("seven:not-a-uuid:0").is_err());
        assert!(WaitingTicket::decode(&format!("7:{}:soon", Uuid::new_v4())).is_err());
    }

    #[test]
    fn test_notice_into_outcome() {
        let paired: PairingOutcome = MatchNotice::Paired {
            chat_session_id: "chat-1".to_string(),
        }
        .into();
        assert_eq!(paired, Ok("chat-1".to_string()));

        let failed: PairingOutcome = MatchNotice::Failed {
            reason: "chat service down".to_string(),
        }
        .into();
        assert!(matches!(failed, Err(MatchmakingError::PairingFailed { .. })));
    }

    proptest! {
        #[test]
        fn prop_ticket_decode_inverts_encode(user_id in any::<i64>(), ms in 0i64..4_102_444_800_000) {
            let ticket = WaitingTicket {
                user_id,
                ticket_id: Uuid::new_v4(),
                enqueued_at: Utc.timestamp_millis_opt(ms).unwrap(),
            };
            let decoded = WaitingTicket::decode(&ticket.encode()).unwrap();
            prop_assert_eq!(decoded, ticket);
        }
    }
}
