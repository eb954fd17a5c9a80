//! Delivery of pairing outcomes to a partner's completion handle
//!
//! A popped partner may be waiting on any instance. The local registry is
//! tried first; otherwise the outcome goes out on the partner's notification
//! channel, where the instance holding the handle picks it up.

use crate::error::{MatchmakingError, PairingResult, Result};
use crate::pairing::registry::SubscriberRegistry;
use crate::types::{MatchNotice, NotificationMessage, UserId, WaitingTicket};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a notice reached (or failed to reach) its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Resolved in this instance's registry
    Local,
    /// Published to at least one listening instance
    Published,
    /// Nobody held a handle for the ticket
    Dropped,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Local => "local",
            Delivery::Published => "published",
            Delivery::Dropped => "dropped",
        }
    }
}

/// Sends a pairing outcome to whoever is waiting on `ticket`
#[async_trait]
pub trait MatchNotifier: Send + Sync {
    async fn notify(&self, ticket: &WaitingTicket, notice: MatchNotice) -> PairingResult<Delivery>;
}

/// Notifier for single-instance deployments
pub struct LocalMatchNotifier {
    registry: Arc<SubscriberRegistry>,
}

impl LocalMatchNotifier {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MatchNotifier for LocalMatchNotifier {
    async fn notify(&self, ticket: &WaitingTicket, notice: MatchNotice) -> PairingResult<Delivery> {
        if self
            .registry
            .resolve(ticket.user_id, ticket.ticket_id, notice.into())
        {
            Ok(Delivery::Local)
        } else {
            Ok(Delivery::Dropped)
        }
    }
}

/// Channel carrying notices for one user
pub fn notification_channel(queue_name: &str, user_id: UserId) -> String {
    format!("{}:notify:{}", queue_name, user_id)
}

/// Pattern matching every user's notification channel
pub fn notification_pattern(queue_name: &str) -> String {
    format!("{}:notify:*", queue_name)
}

/// Notifier that reaches handles on other instances through Redis pub/sub
pub struct RedisMatchNotifier {
    registry: Arc<SubscriberRegistry>,
    connection: ConnectionManager,
    queue_name: String,
}

impl RedisMatchNotifier {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        connection: ConnectionManager,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            connection,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl MatchNotifier for RedisMatchNotifier {
    async fn notify(&self, ticket: &WaitingTicket, notice: MatchNotice) -> PairingResult<Delivery> {
        if self
            .registry
            .resolve(ticket.user_id, ticket.ticket_id, notice.clone().into())
        {
            return Ok(Delivery::Local);
        }

        let message = NotificationMessage {
            user_id: ticket.user_id,
            ticket_id: ticket.ticket_id,
            notice,
        };
        let payload =
            serde_json::to_string(&message).map_err(|e| MatchmakingError::InternalError {
                message: format!("Failed to serialize notification: {}", e),
            })?;

        let channel = notification_channel(&self.queue_name, ticket.user_id);
        let mut con = self.connection.clone();
        let receivers: i64 = con.publish(&channel, payload).await?;

        debug!(
            "Published notice for user {} on {} ({} receivers)",
            ticket.user_id, channel, receivers
        );
        Ok(if receivers > 0 {
            Delivery::Published
        } else {
            Delivery::Dropped
        })
    }
}

/// Resolve a registry entry from a raw notification payload.
///
/// Returns whether a handle on this instance took the notice.
pub fn deliver_notification(registry: &SubscriberRegistry, payload: &str) -> bool {
    match serde_json::from_str::<NotificationMessage>(payload) {
        Ok(message) => {
            registry.resolve(message.user_id, message.ticket_id, message.notice.into())
        }
        Err(e) => {
            warn!("Ignoring malformed notification {:?}: {}", payload, e);
            false
        }
    }
}

/// Pattern subscriber resolving this instance's handles from published notices
pub struct NotificationListener {
    client: redis::Client,
    pattern: String,
    registry: Arc<SubscriberRegistry>,
}

impl NotificationListener {
    pub fn new(client: redis::Client, queue_name: &str, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            client,
            pattern: notification_pattern(queue_name),
            registry,
        }
    }

    /// Listen until `shutdown` fires, reconnecting with exponential backoff
    pub async fn run(self, shutdown: CancellationToken) {
        let mut delay = Duration::from_millis(500);

        while !shutdown.is_cancelled() {
            match self.listen(&shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        "Notification listener on '{}' failed: {}. Reconnecting in {:?}",
                        self.pattern, e, delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn listen(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&self.pattern).await?;
        info!("Listening for pairing notices on '{}'", self.pattern);

        let messages = pubsub.on_message();
        tokio::pin!(messages);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Notification listener stopped");
                    return Ok(());
                }
                message = messages.next() => {
                    let Some(message) = message else {
                        anyhow::bail!("pub/sub stream closed");
                    };
                    match message.get_payload::<String>() {
                        Ok(payload) => {
                            deliver_notification(&self.registry, &payload);
                        }
                        Err(e) => warn!("Unreadable notification payload: {}", e),
                    }
                }
            }
        }
    }
}
