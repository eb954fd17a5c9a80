//! Main application state and service coordination
//!
//! Wires the pairing engine to its backends (Redis and AMQP, or in-process
//! stand-ins), runs the HTTP servers and background tasks, and shuts them
//! down in order.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::publisher::{AmqpEventPublisher, EventPublisher, LogEventPublisher, PublisherConfig};
use crate::api::ApiServer;
use crate::config::AppConfig;
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector};
use crate::pairing::{
    LocalMatchNotifier, MatchNotifier, NotificationListener, PairingOrchestrator,
    RedisMatchNotifier, SubscriberRegistry,
};
use crate::queue::{InMemoryQueueStore, QueueStore, RedisQueueStore};
use crate::service::health::HealthCheck;
use crate::session::{AmqpSessionCreator, LocalSessionCreator, SessionCreator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Queue store error: {message}")]
    QueueStore { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Broker-side handles kept for health checks and shutdown
struct AmqpBackend {
    connection: Arc<AmqpConnection>,
    session_creator: Arc<AmqpSessionCreator>,
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    orchestrator: Arc<PairingOrchestrator>,

    metrics: Arc<MetricsCollector>,

    /// Present unless running in-memory
    amqp: Option<AmqpBackend>,

    /// Client for the notification listener, present unless running in-memory
    redis_client: Option<redis::Client>,

    /// Fired once on shutdown; every server, task and wait hangs off it
    shutdown: CancellationToken,

    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    is_running: Arc<RwLock<bool>>,

    started_at: Instant,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing rendezvous pairing service");

        let metrics = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let registry = Arc::new(SubscriberRegistry::new());

        let (store, notifier, redis_client): (
            Arc<dyn QueueStore>,
            Arc<dyn MatchNotifier>,
            Option<redis::Client>,
        ) = if config.service.in_memory {
            info!("Using in-memory queue store (single instance)");
            (
                Arc::new(InMemoryQueueStore::new()),
                Arc::new(LocalMatchNotifier::new(registry.clone())),
                None,
            )
        } else {
            Self::initialize_redis(&config, registry.clone()).await?
        };

        let (session_creator, events, amqp): (
            Arc<dyn SessionCreator>,
            Arc<dyn EventPublisher>,
            Option<AmqpBackend>,
        ) = if config.service.in_memory {
            info!("Using local session creator; events are logged only");
            (
                Arc::new(LocalSessionCreator::new()),
                Arc::new(LogEventPublisher),
                None,
            )
        } else {
            let (creator, publisher, backend) = Self::initialize_amqp(&config).await?;
            (creator, publisher, Some(backend))
        };

        let orchestrator = Arc::new(PairingOrchestrator::new(
            store,
            registry,
            notifier,
            session_creator,
            events,
            metrics.clone(),
            config.pairing_config(),
        ));

        Ok(Self {
            config,
            orchestrator,
            metrics,
            amqp,
            redis_client,
            shutdown: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Connect the shared queue and the cross-instance notifier
    async fn initialize_redis(
        config: &AppConfig,
        registry: Arc<SubscriberRegistry>,
    ) -> Result<
        (
            Arc<dyn QueueStore>,
            Arc<dyn MatchNotifier>,
            Option<redis::Client>,
        ),
        ServiceError,
    > {
        info!("Connecting to Redis queue store: {}", config.redis.url);
        let queue_name = &config.matchmaking.queue_name;

        let store = RedisQueueStore::connect(&config.redis.url, queue_name)
            .await
            .map_err(|e| ServiceError::QueueStore {
                message: format!("Failed to connect to Redis: {}", e),
            })?;
        let client =
            redis::Client::open(config.redis.url.as_str()).map_err(|e| ServiceError::QueueStore {
                message: format!("Invalid Redis URL: {}", e),
            })?;

        let notifier: Arc<dyn MatchNotifier> = Arc::new(RedisMatchNotifier::new(
            registry,
            store.connection(),
            queue_name.clone(),
        ));
        let store: Arc<dyn QueueStore> = Arc::new(store);
        Ok((store, notifier, Some(client)))
    }

    /// Connect to the broker and set up the session RPC and event publisher
    async fn initialize_amqp(
        config: &AppConfig,
    ) -> Result<(Arc<dyn SessionCreator>, Arc<dyn EventPublisher>, AmqpBackend), ServiceError>
    {
        info!("Connecting to AMQP broker");

        let amqp_config = AmqpConfig::from_url(&config.amqp.url)
            .map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?
            .with_retries(config.amqp.max_retry_attempts, config.amqp.retry_delay_ms);

        let connection = Arc::new(AmqpConnection::new(amqp_config).await.map_err(|e| {
            ServiceError::AmqpConnection {
                message: format!("Failed to connect to AMQP: {}", e),
            }
        })?);

        let open_channel = |purpose: &'static str| {
            let connection = connection.clone();
            async move {
                connection
                    .open_channel()
                    .await
                    .map_err(|e| ServiceError::AmqpConnection {
                        message: format!("Failed to open {} channel: {}", purpose, e),
                    })
            }
        };

        let publisher_config = PublisherConfig {
            exchange_name: config.amqp.exchange_name.clone(),
            ..PublisherConfig::default()
        };
        let publisher = AmqpEventPublisher::new(open_channel("event").await?, publisher_config)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize event publisher: {}", e),
            })?;

        let session_creator = Arc::new(
            AmqpSessionCreator::new(
                open_channel("session").await?,
                config.session_reply_timeout(),
            )
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize session creator: {}", e),
            })?,
        );

        let backend = AmqpBackend {
            connection,
            session_creator: session_creator.clone(),
        };
        let publisher: Arc<dyn EventPublisher> = Arc::new(publisher);
        let session_creator: Arc<dyn SessionCreator> = session_creator;
        Ok((session_creator, publisher, backend))
    }

    /// Start the servers and background tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting rendezvous pairing service");

        *self.is_running.write().await = true;

        self.start_api_server().await?;
        self.start_health_server().await;
        self.start_notification_listener().await;
        self.start_background_tasks().await;

        info!("✅ Rendezvous pairing service started successfully");
        Ok(())
    }

    async fn start_api_server(&self) -> Result<(), ServiceError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.http_port));
        let server = ApiServer::bind(addr, self.orchestrator.clone(), self.shutdown.child_token())
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("{:#}", e),
            })?;

        self.spawn(async move {
            if let Err(e) = server.serve().await {
                error!("Matchmaking API failed: {:#}", e);
            }
        })
        .await;
        Ok(())
    }

    async fn start_health_server(self: &Arc<Self>) {
        let health_config = HealthServerConfig {
            port: self.config.service.health_port,
            host: "0.0.0.0".to_string(),
        };
        let server = HealthServer::new(health_config, self.metrics.clone())
            .with_app_state(self.clone())
            .with_shutdown(self.shutdown.child_token());

        self.spawn(async move {
            if let Err(e) = server.start().await {
                error!("Health server failed: {:#}", e);
            }
        })
        .await;
        info!(
            "✅ Health and metrics endpoints on port {}",
            self.config.service.health_port
        );
    }

    async fn start_notification_listener(&self) {
        let Some(client) = self.redis_client.clone() else {
            debug!("No notification listener in in-memory mode");
            return;
        };

        let listener = NotificationListener::new(
            client,
            &self.config.matchmaking.queue_name,
            self.orchestrator.registry(),
        );
        let shutdown = self.shutdown.child_token();
        self.spawn(listener.run(shutdown)).await;
    }

    async fn start_background_tasks(&self) {
        info!("Starting background maintenance tasks...");

        // Stale ticket sweep
        let sweep_task = {
            let orchestrator = self.orchestrator.clone();
            let cleanup_interval = self.config.cleanup_interval();
            let shutdown = self.shutdown.child_token();

            async move {
                let mut interval = tokio::time::interval(cleanup_interval);
                info!(
                    "Stale ticket sweep started ({}s interval)",
                    cleanup_interval.as_secs()
                );

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }

                    match orchestrator.sweep_stale_tickets().await {
                        Ok(0) => debug!("Sweep completed - no stale tickets found"),
                        Ok(purged) => info!("Purged {} stale tickets", purged),
                        Err(e) => warn!("Stale ticket sweep failed: {}", e),
                    }
                }

                info!("Stale ticket sweep stopped");
            }
        };
        self.spawn(sweep_task).await;

        // Pairing stats and queue length into gauges
        let metrics_task = {
            let orchestrator = self.orchestrator.clone();
            let metrics = self.metrics.clone();
            let shutdown = self.shutdown.child_token();
            let started_at = self.started_at;

            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(10));

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }

                    let stats = orchestrator.stats();
                    metrics.update_from_stats(&stats);
                    metrics
                        .service()
                        .uptime_seconds
                        .set(started_at.elapsed().as_secs() as i64);

                    match orchestrator.store().len().await {
                        Ok(length) => metrics.set_queue_length(length),
                        Err(e) => debug!("Queue length unavailable: {}", e),
                    }
                }

                debug!("Metrics update task stopped");
            }
        };
        self.spawn(metrics_task).await;
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.background_tasks.lock().await.push(tokio::spawn(task));
    }

    /// Perform graceful shutdown.
    ///
    /// Waiting callers end with `Cancelled`, servers drain, and background
    /// tasks get the configured shutdown timeout to finish.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of rendezvous service");

        *self.is_running.write().await = false;
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().await.drain(..).collect();
        let count = tasks.len();
        let drain = futures::future::join_all(tasks);
        match tokio::time::timeout(self.config.shutdown_timeout(), drain).await {
            Ok(results) => {
                for result in results.into_iter().filter_map(|r| r.err()) {
                    warn!("Background task ended abnormally: {}", result);
                }
                info!("✅ {} background tasks stopped", count);
            }
            Err(_) => {
                return Err(ServiceError::BackgroundTask {
                    message: format!(
                        "Background tasks still running after {:?}",
                        self.config.shutdown_timeout()
                    ),
                });
            }
        }

        if let Some(amqp) = &self.amqp {
            let unanswered = amqp.session_creator.pending_requests();
            if unanswered > 0 {
                warn!(
                    "Stopping session reply consumer with {} requests unanswered",
                    unanswered
                );
            }
            if let Err(e) = amqp.session_creator.stop().await {
                warn!("Failed to stop session reply consumer: {}", e);
            }
            if let Err(e) = amqp.connection.close().await {
                warn!("Failed to close AMQP connection: {}", e);
            } else {
                info!("✅ AMQP connection closed");
            }
        }

        info!("Final pairing statistics: {:?}", self.orchestrator.stats());
        info!("✅ Rendezvous service shutdown completed");
        Ok(())
    }

    /// Run one full health check and export the result as gauges
    pub async fn refresh_health(self: &Arc<Self>) {
        match HealthCheck::check(self.clone()).await {
            Ok(health) => {
                self.metrics.update_health_status(health.status.as_gauge());
                debug!("Health check: {}", health.status);
            }
            Err(e) => warn!("Health check failed: {}", e),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn orchestrator(&self) -> Arc<PairingOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// AMQP connection for health checks; `None` in in-memory mode
    pub fn amqp_connection(&self) -> Option<Arc<AmqpConnection>> {
        self.amqp.as_ref().map(|amqp| amqp.connection.clone())
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.service.in_memory = true;
        // Ephemeral ports so parallel tests never collide
        config.service.http_port = 0;
        config.service.health_port = 0;
        config.service.shutdown_timeout_seconds = 5;
        config
    }

    #[tokio::test]
    async fn test_in_memory_state_has_no_brokers() {
        let app_state = AppState::new(in_memory_config()).await.unwrap();

        assert!(app_state.amqp_connection().is_none());
        assert!(!app_state.is_running().await);
        assert_eq!(app_state.orchestrator().store().backend(), "memory");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let app_state = Arc::new(AppState::new(in_memory_config()).await.unwrap());
        app_state.start().await.unwrap();
        assert!(app_state.is_running().await);

        let orchestrator = app_state.orchestrator();
        let pending = match orchestrator
            .find_match(7, app_state.shutdown_token().child_token())
            .await
            .unwrap()
        {
            crate::pairing::MatchOutcome::Pending(pending) => pending,
            other => panic!("expected to wait, got {:?}", other),
        };

        app_state.shutdown().await.unwrap();
        assert!(!app_state.is_running().await);
        assert_eq!(
            pending.wait().await,
            Err(crate::error::MatchmakingError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_refresh_health_exports_gauge() {
        let app_state = Arc::new(AppState::new(in_memory_config()).await.unwrap());
        app_state.refresh_health().await;

        // Not started, so unhealthy
        assert_eq!(app_state.metrics().service().health_status.get(), 0);
    }
}
