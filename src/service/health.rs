//! Health checks for the rendezvous service
//!
//! Readiness and liveness probes plus the detailed component report served
//! on `/stats`.

use crate::pairing::PairingStats;
use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value exported as `rendezvous_health_status`
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    /// The worse of two statuses
    fn worst(self, other: HealthStatus) -> HealthStatus {
        if self.as_gauge() <= other.as_gauge() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Why the component is not healthy, or which backend is in use
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ComponentCheck {
    fn finish(
        name: &str,
        status: HealthStatus,
        message: Option<String>,
        start: Instant,
    ) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Pairing counters since start
    pub pairing: PairingStats,
    /// Tickets in the shared queue across all instances, if the store answered
    pub queue_length: Option<usize>,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Perform a full health check of the service
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let checks = vec![
            Self::check_service_running(&app_state).await,
            Self::check_queue_store(&app_state).await,
            Self::check_amqp(&app_state),
        ];

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));

        for check in &checks {
            app_state
                .metrics()
                .update_component_health(&check.name, check.status == HealthStatus::Healthy);
        }

        let stats = Self::gather_service_stats(&app_state).await;

        Ok(HealthCheck {
            status,
            service: app_state.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Liveness: the service has started and is not shutting down
    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness: running, and the queue store answers
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if !app_state.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        let store = Self::check_queue_store(&app_state).await.status;
        let amqp = Self::check_amqp(&app_state).status;
        Ok(store.worst(amqp))
    }

    async fn check_service_running(app_state: &AppState) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = if app_state.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck::finish("service_running", status, message, start)
    }

    async fn check_queue_store(app_state: &AppState) -> ComponentCheck {
        let start = Instant::now();
        let store = app_state.orchestrator().store();

        let (status, message) = match store.ping().await {
            Ok(()) => (HealthStatus::Healthy, Some(store.backend().to_string())),
            Err(e) => {
                warn!("Queue store health check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("{} unreachable: {}", store.backend(), e)),
                )
            }
        };

        ComponentCheck::finish("queue_store", status, message, start)
    }

    fn check_amqp(app_state: &AppState) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = match app_state.amqp_connection() {
            Some(connection) if connection.is_alive() => (HealthStatus::Healthy, None),
            Some(_) => (
                HealthStatus::Unhealthy,
                Some("AMQP connection closed".to_string()),
            ),
            None => (HealthStatus::Healthy, Some("disabled (in-memory mode)".to_string())),
        };

        ComponentCheck::finish("amqp_connection", status, message, start)
    }

    async fn gather_service_stats(app_state: &AppState) -> ServiceStats {
        let orchestrator = app_state.orchestrator();
        let queue_length = match orchestrator.store().len().await {
            Ok(len) => Some(len),
            Err(e) => {
                debug!("Queue length unavailable for health check: {}", e);
                None
            }
        };

        ServiceStats {
            pairing: orchestrator.stats(),
            queue_length,
            uptime_seconds: app_state.uptime().as_secs(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
