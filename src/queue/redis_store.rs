//! Redis-backed queue store shared across service instances
//!
//! The queue is a single Redis list. Every read-modify-write runs as a Lua
//! script so two instances can never pop the same ticket.

use crate::error::{MatchmakingError, PairingResult};
use crate::queue::scripts;
use crate::queue::store::{Arrival, MatchAttempt, QueueStore};
use crate::types::{UserId, WaitingTicket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tracing::{debug, info, warn};

/// Prefix every ticket of `user_id` starts with
pub fn user_prefix(user_id: UserId) -> String {
    format!("{}:", user_id)
}

/// Queue store backed by a Redis list
pub struct RedisQueueStore {
    connection: ConnectionManager,
    queue_key: String,
    enqueue_script: Script,
    match_script: Script,
    arrival_script: Script,
    contains_script: Script,
    purge_script: Script,
}

impl RedisQueueStore {
    /// Connect to Redis and bind to the given logical queue
    pub async fn connect(url: &str, queue_key: &str) -> PairingResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis queue store, queue key '{}'", queue_key);
        Ok(Self::with_connection(connection, queue_key))
    }

    /// Bind to an existing connection manager
    pub fn with_connection(connection: ConnectionManager, queue_key: &str) -> Self {
        Self {
            connection,
            queue_key: queue_key.to_string(),
            enqueue_script: Script::new(scripts::enqueue_if_absent_script()),
            match_script: Script::new(scripts::match_or_noop_script()),
            arrival_script: Script::new(scripts::match_or_enqueue_script()),
            contains_script: Script::new(scripts::contains_user_script()),
            purge_script: Script::new(scripts::purge_stale_script()),
        }
    }

    /// Clone of the underlying connection, shared with the notifier
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, ticket: &WaitingTicket) -> PairingResult<()> {
        let mut con = self.connection.clone();
        let appended: i64 = self
            .enqueue_script
            .key(&self.queue_key)
            .arg(user_prefix(ticket.user_id))
            .arg(ticket.encode())
            .invoke_async(&mut con)
            .await?;

        if appended == 0 {
            return Err(MatchmakingError::AlreadyQueued {
                user_id: ticket.user_id,
            });
        }

        debug!(
            "Ticket {} for user {} appended to '{}'",
            ticket.ticket_id, ticket.user_id, self.queue_key
        );
        Ok(())
    }

    async fn atomic_match_or_noop(
        &self,
        self_id: UserId,
        stale_before: DateTime<Utc>,
    ) -> PairingResult<MatchAttempt> {
        let mut con = self.connection.clone();
        let head: Option<String> = self
            .match_script
            .key(&self.queue_key)
            .arg(user_prefix(self_id))
            .arg(stale_before.timestamp_millis())
            .invoke_async(&mut con)
            .await?;

        match head {
            Some(raw) => {
                let ticket = WaitingTicket::decode(&raw).map_err(|e| {
                    warn!("Popped unreadable ticket {:?} from '{}'", raw, self.queue_key);
                    e
                })?;
                Ok(MatchAttempt::Partner(ticket))
            }
            None => Ok(MatchAttempt::NoPartner),
        }
    }

    async fn match_or_enqueue(
        &self,
        ticket: &WaitingTicket,
        stale_before: DateTime<Utc>,
    ) -> PairingResult<Arrival> {
        let mut con = self.connection.clone();
        let (status, head): (i64, Option<String>) = self
            .arrival_script
            .key(&self.queue_key)
            .arg(user_prefix(ticket.user_id))
            .arg(ticket.encode())
            .arg(stale_before.timestamp_millis())
            .invoke_async(&mut con)
            .await?;

        match (status, head) {
            (-1, _) => Err(MatchmakingError::AlreadyQueued {
                user_id: ticket.user_id,
            }),
            (1, Some(raw)) => {
                let partner = WaitingTicket::decode(&raw).map_err(|e| {
                    warn!("Popped unreadable ticket {:?} from '{}'", raw, self.queue_key);
                    e
                })?;
                Ok(Arrival::Partner(partner))
            }
            (0, _) => {
                debug!(
                    "Ticket {} for user {} appended to '{}'",
                    ticket.ticket_id, ticket.user_id, self.queue_key
                );
                Ok(Arrival::Queued)
            }
            (status, _) => Err(MatchmakingError::StoreError {
                message: format!("Unexpected match-or-enqueue reply status {}", status),
            }),
        }
    }

    async fn remove(&self, ticket: &WaitingTicket) -> PairingResult<bool> {
        let mut con = self.connection.clone();
        let removed: i64 = con.lrem(&self.queue_key, 1, ticket.encode()).await?;
        Ok(removed > 0)
    }

    async fn contains(&self, user_id: UserId) -> PairingResult<bool> {
        let mut con = self.connection.clone();
        let found: i64 = self
            .contains_script
            .key(&self.queue_key)
            .arg(user_prefix(user_id))
            .invoke_async(&mut con)
            .await?;
        Ok(found == 1)
    }

    async fn len(&self) -> PairingResult<usize> {
        let mut con = self.connection.clone();
        let len: usize = con.llen(&self.queue_key).await?;
        Ok(len)
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> PairingResult<usize> {
        let mut con = self.connection.clone();
        let removed: i64 = self
            .purge_script
            .key(&self.queue_key)
            .arg(cutoff.timestamp_millis())
            .invoke_async(&mut con)
            .await?;
        Ok(removed.max(0) as usize)
    }

    async fn ping(&self) -> PairingResult<()> {
        let mut con = self.connection.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
