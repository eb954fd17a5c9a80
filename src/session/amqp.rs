//! Session creation over AMQP request/reply
//!
//! Requests go to the chat service's work queue with `reply_to` pointing at an
//! exclusive, server-named queue owned by this instance. Replies are matched
//! back to the waiting call by `correlation_id`.

use crate::amqp::messages::{decode_session_reply, encode_session_request, SESSION_REQUEST_QUEUE};
use crate::error::{MatchmakingError, PairingResult, Result};
use crate::session::SessionCreator;
use crate::types::{ChatSessionId, CreateSessionRequest, UserId};
use amqprs::{
    channel::{
        BasicCancelArguments, BasicConsumeArguments, BasicPublishArguments, Channel,
        QueueDeclareArguments,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<PairingResult<ChatSessionId>>>>>;

/// RPC client for the chat service's session allocation
pub struct AmqpSessionCreator {
    channel: Channel,
    reply_queue: String,
    consumer_tag: String,
    pending: PendingReplies,
    reply_timeout: Duration,
}

impl AmqpSessionCreator {
    /// Declare the request and reply queues and start consuming replies
    pub async fn new(channel: Channel, reply_timeout: Duration) -> Result<Self> {
        let request_args = QueueDeclareArguments::new(SESSION_REQUEST_QUEUE)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel.queue_declare(request_args).await.map_err(|e| {
            MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to declare queue {}: {}", SESSION_REQUEST_QUEUE, e),
            }
        })?;

        let reply_args = QueueDeclareArguments::new("")
            .exclusive(true)
            .auto_delete(true)
            .finish();
        let (reply_queue, _, _) = channel
            .queue_declare(reply_args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to declare reply queue: {}", e),
            })?
            .ok_or_else(|| MatchmakingError::AmqpConnectionFailed {
                message: "Broker did not name the reply queue".to_string(),
            })?;

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let consumer_tag = format!("session-replies-{}", uuid::Uuid::new_v4());

        let mut consume_args = BasicConsumeArguments::new(&reply_queue, &consumer_tag);
        consume_args.no_ack = true;
        consume_args.exclusive = true;
        channel
            .basic_consume(ReplyConsumer::new(pending.clone()), consume_args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to consume session replies: {}", e),
            })?;

        info!(
            "Session creator ready - requests: '{}', replies: '{}'",
            SESSION_REQUEST_QUEUE, reply_queue
        );

        Ok(Self {
            channel,
            reply_queue,
            consumer_tag,
            pending,
            reply_timeout,
        })
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Stop consuming replies
    pub async fn stop(&self) -> Result<()> {
        self.channel
            .basic_cancel(BasicCancelArguments::new(&self.consumer_tag))
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to stop reply consumer: {}", e),
            })?;
        Ok(())
    }

    fn forget(&self, correlation_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(correlation_id);
        }
    }

    async fn send_request(
        &self,
        correlation_id: &str,
        request: &CreateSessionRequest,
    ) -> PairingResult<()> {
        let payload =
            encode_session_request(request).map_err(|e| MatchmakingError::SessionCreationError {
                message: e.to_string(),
            })?;

        let mut properties = BasicProperties::default();
        properties
            .with_correlation_id(correlation_id)
            .with_reply_to(&self.reply_queue)
            .with_content_type("application/json");

        let args = BasicPublishArguments::new("", SESSION_REQUEST_QUEUE);
        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::SessionCreationError {
                message: format!("Failed to publish session request: {}", e),
            })
    }
}

#[async_trait]
impl SessionCreator for AmqpSessionCreator {
    async fn create_session(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> PairingResult<ChatSessionId> {
        let start_time = Instant::now();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending
            .lock()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire pending replies lock".to_string(),
            })?
            .insert(correlation_id.clone(), reply_tx);

        let request = CreateSessionRequest { user_a, user_b };
        if let Err(e) = self.send_request(&correlation_id, &request).await {
            self.forget(&correlation_id);
            return Err(e);
        }

        let result = match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(MatchmakingError::SessionCreationError {
                message: "Reply consumer went away".to_string(),
            }),
            Err(_) => {
                self.forget(&correlation_id);
                Err(MatchmakingError::SessionCreationError {
                    message: format!("No reply within {:?}", self.reply_timeout),
                })
            }
        };

        debug!(
            "Session request {} for users {} and {} finished in {:.2}ms",
            correlation_id,
            user_a,
            user_b,
            start_time.elapsed().as_secs_f64() * 1000.0
        );
        result
    }
}

/// Routes replies to the call waiting on their correlation id
struct ReplyConsumer {
    pending: PendingReplies,
}

impl ReplyConsumer {
    fn new(pending: PendingReplies) -> Self {
        Self { pending }
    }

    fn take_waiter(
        &self,
        correlation_id: &str,
    ) -> Option<oneshot::Sender<PairingResult<ChatSessionId>>> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(correlation_id))
    }
}

#[async_trait]
impl AsyncConsumer for ReplyConsumer {
    async fn consume(
        &mut self,
        _channel: &Channel,
        deliver: Deliver,
        basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let Some(correlation_id) = basic_properties.correlation_id().map(|id| id.to_string())
        else {
            warn!(
                "Session reply without correlation id - delivery_tag: {}",
                deliver.delivery_tag()
            );
            return;
        };

        match self.take_waiter(&correlation_id) {
            Some(waiter) => {
                let _ = waiter.send(decode_session_reply(&content));
            }
            None => debug!(
                "Late or unknown session reply {} dropped",
                correlation_id
            ),
        }
    }
}
