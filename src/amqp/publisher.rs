//! AMQP event publisher for outbound pairing events

use crate::amqp::messages::{
    MessageEnvelope, EVENTS_EXCHANGE, PAIRING_COMPLETED_ROUTING_KEY, WAIT_ENDED_ROUTING_KEY,
};
use crate::error::{MatchmakingError, Result};
use crate::types::*;
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Trait for publishing pairing events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a PairingCompleted event
    async fn publish_pairing_completed(&self, event: PairingCompleted) -> Result<()>;

    /// Publish a WaitEnded event
    async fn publish_wait_ended(&self, event: WaitEnded) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange_name: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
    /// Dedup cache is cleared once it grows past this many ids
    pub deduplication_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange_name: EVENTS_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
            deduplication_capacity: 10_000,
        }
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
    published_messages: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl AmqpEventPublisher {
    /// Create a new event publisher and declare its exchange
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            published_messages: std::sync::Mutex::new(std::collections::HashSet::new()),
        };

        publisher.setup_exchange().await?;

        Ok(publisher)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange_name, "topic")
            .durable(true)
            .finish();
        self.channel.exchange_declare(args).await.map_err(|e| {
            MatchmakingError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare events exchange {}: {}",
                    self.config.exchange_name, e
                ),
            }
        })?;

        info!(
            "Declared AMQP events exchange '{}'",
            self.config.exchange_name
        );
        Ok(())
    }

    /// Publish an envelope to the events exchange with retry logic
    async fn publish_envelope<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        if self.config.enable_deduplication {
            let published_messages =
                self.published_messages
                    .lock()
                    .map_err(|_| MatchmakingError::InternalError {
                        message: "Failed to acquire published messages lock".to_string(),
                    })?;
            if published_messages.contains(&envelope.correlation_id) {
                debug!(
                    "Message {} already published, skipping",
                    envelope.correlation_id
                );
                return Ok(());
            }
        }

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(_) => {
                    if self.config.enable_deduplication {
                        self.remember(&envelope.correlation_id)?;
                    }

                    debug!(
                        "Published message {} with routing key {}",
                        envelope.correlation_id, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    fn remember(&self, correlation_id: &str) -> Result<()> {
        let mut published_messages =
            self.published_messages
                .lock()
                .map_err(|_| MatchmakingError::InternalError {
                    message: "Failed to acquire published messages lock".to_string(),
                })?;
        if published_messages.len() >= self.config.deduplication_capacity {
            published_messages.clear();
        }
        published_messages.insert(correlation_id.to_string());
        Ok(())
    }

    /// Single publish attempt
    async fn try_publish<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange_name, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    /// Get number of cached message IDs (for monitoring)
    pub fn cached_message_count(&self) -> usize {
        self.published_messages
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_pairing_completed(&self, event: PairingCompleted) -> Result<()> {
        let envelope = MessageEnvelope::new(event, PAIRING_COMPLETED_ROUTING_KEY.to_string());
        self.publish_envelope(&envelope).await
    }

    async fn publish_wait_ended(&self, event: WaitEnded) -> Result<()> {
        let envelope = MessageEnvelope::new(event, WAIT_ENDED_ROUTING_KEY.to_string());
        self.publish_envelope(&envelope).await
    }
}

/// Publisher used when no broker is configured; events only reach the log
#[derive(Debug, Default)]
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish_pairing_completed(&self, event: PairingCompleted) -> Result<()> {
        info!(
            "Pairing completed - session: {}, users: {} + {}",
            event.chat_session_id, event.requester_id, event.partner_id
        );
        Ok(())
    }

    async fn publish_wait_ended(&self, event: WaitEnded) -> Result<()> {
        info!(
            "Wait ended - user: {}, reason: {}, waited: {}ms",
            event.user_id, event.reason, event.waited_ms
        );
        Ok(())
    }
}

/// Mock event publisher for testing
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: std::sync::Mutex<Vec<AmqpMessage>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all published events (for testing)
    pub fn get_published_events(&self) -> Vec<AmqpMessage> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Wait-ended events for one user, oldest first (for testing)
    pub fn wait_endings_for(&self, user_id: UserId) -> Vec<WaitEndReason> {
        self.get_published_events()
            .into_iter()
            .filter_map(|event| match event {
                AmqpMessage::WaitEnded(ended) if ended.user_id == user_id => Some(ended.reason),
                _ => None,
            })
            .collect()
    }

    /// Clear published events (for testing)
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.published_events.lock() {
            events.clear();
        }
    }

    fn record(&self, event: AmqpMessage) {
        if let Ok(mut events) = self.published_events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_pairing_completed(&self, event: PairingCompleted) -> Result<()> {
        self.record(AmqpMessage::PairingCompleted(event));
        Ok(())
    }

    async fn publish_wait_ended(&self, event: WaitEnded) -> Result<()> {
        self.record(AmqpMessage::WaitEnded(event));
        Ok(())
    }
}
