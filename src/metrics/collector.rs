//! Metrics collection using Prometheus
//!
//! Every metric lives on one [`Registry`] owned by the collector and is
//! exported as `rendezvous_*` on the `/metrics` endpoint.

use crate::pairing::stats::PairingStats;
use crate::types::WaitEndReason;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the pairing service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Pairing engine metrics
    pairing_metrics: PairingMetrics,

    /// Session creator metrics
    session_metrics: SessionMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages published
    pub amqp_messages_total: IntCounterVec,

    /// AMQP publish errors
    pub amqp_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Pairing engine metrics
#[derive(Clone)]
pub struct PairingMetrics {
    /// `find_match` calls by immediate outcome
    pub requests_total: IntCounterVec,

    /// Completed pairings
    pub pairings_total: IntCounter,

    /// Waits that ended without a partner, by reason
    pub waits_ended_total: IntCounterVec,

    /// Time spent waiting in the queue, by how the wait ended
    pub wait_duration_seconds: HistogramVec,

    /// Handles registered on this instance
    pub players_waiting: IntGauge,

    /// Tickets in the shared queue
    pub queue_length: IntGauge,

    /// Stale tickets removed by the sweeper or the match script
    pub stale_tickets_purged_total: IntCounter,

    /// Partner notifications by delivery route
    pub notifications_total: IntCounterVec,
}

/// Session creator metrics
#[derive(Clone)]
pub struct SessionMetrics {
    /// Session creation calls by status
    pub sessions_total: IntCounterVec,

    /// Session creation latency by status
    pub session_creation_duration: HistogramVec,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Time until `find_match` returns (paired or pending)
    pub find_match_duration: Histogram,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let pairing_metrics = PairingMetrics::new(&registry)?;
        let session_metrics = SessionMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            pairing_metrics,
            session_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get pairing metrics
    pub fn pairing(&self) -> &PairingMetrics {
        &self.pairing_metrics
    }

    /// Get session metrics
    pub fn session(&self) -> &SessionMetrics {
        &self.session_metrics
    }

    /// Get performance metrics
    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Refresh gauges from the pairing stats snapshot
    pub fn update_from_stats(&self, stats: &PairingStats) {
        self.pairing_metrics
            .players_waiting
            .set(stats.players_waiting as i64);
    }

    /// Record the immediate result of a `find_match` call
    pub fn record_request(&self, outcome: &str, duration: Duration) {
        self.pairing_metrics
            .requests_total
            .with_label_values(&[outcome])
            .inc();

        self.performance_metrics
            .find_match_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a pairing; `partner_waited` is how long the popped partner queued
    pub fn record_pairing(&self, partner_waited: Duration) {
        self.pairing_metrics.pairings_total.inc();
        self.pairing_metrics
            .wait_duration_seconds
            .with_label_values(&["paired"])
            .observe(partner_waited.as_secs_f64());
    }

    /// Record a wait that ended without a partner
    pub fn record_wait_ended(&self, reason: WaitEndReason, waited: Duration) {
        let reason = reason.to_string();
        self.pairing_metrics
            .waits_ended_total
            .with_label_values(&[&reason])
            .inc();
        self.pairing_metrics
            .wait_duration_seconds
            .with_label_values(&[&reason])
            .observe(waited.as_secs_f64());
    }

    /// Record a session creation call
    pub fn record_session_creation(&self, success: bool, duration: Duration) {
        let status = if success { "success" } else { "failed" };

        self.session_metrics
            .sessions_total
            .with_label_values(&[status])
            .inc();
        self.session_metrics
            .session_creation_duration
            .with_label_values(&[status])
            .observe(duration.as_secs_f64());
    }

    /// Record how a partner notification was delivered
    pub fn record_notification(&self, route: &str) {
        self.pairing_metrics
            .notifications_total
            .with_label_values(&[route])
            .inc();
    }

    /// Record stale tickets removed from the queue
    pub fn record_stale_purged(&self, count: usize) {
        self.pairing_metrics
            .stale_tickets_purged_total
            .inc_by(count as u64);
    }

    /// Update the shared queue length gauge
    pub fn set_queue_length(&self, length: usize) {
        self.pairing_metrics.queue_length.set(length as i64);
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("rendezvous_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_amqp_messages_total",
                "Total AMQP messages published",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("rendezvous_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "rendezvous_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("rendezvous_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            health_status,
            component_health,
        })
    }
}

impl PairingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_requests_total",
                "find_match calls by immediate outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let pairings_total =
            IntCounter::new("rendezvous_pairings_total", "Total completed pairings")?;
        registry.register(Box::new(pairings_total.clone()))?;

        let waits_ended_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_waits_ended_total",
                "Waits that ended without a partner",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(waits_ended_total.clone()))?;

        let wait_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rendezvous_wait_duration_seconds",
                "Time spent waiting in the queue",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(wait_duration_seconds.clone()))?;

        let players_waiting = IntGauge::new(
            "rendezvous_players_waiting",
            "Users waiting on this instance",
        )?;
        registry.register(Box::new(players_waiting.clone()))?;

        let queue_length =
            IntGauge::new("rendezvous_queue_length", "Tickets in the shared queue")?;
        registry.register(Box::new(queue_length.clone()))?;

        let stale_tickets_purged_total = IntCounter::new(
            "rendezvous_stale_tickets_purged_total",
            "Stale tickets removed from the queue",
        )?;
        registry.register(Box::new(stale_tickets_purged_total.clone()))?;

        let notifications_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_notifications_total",
                "Partner notifications by delivery route",
            ),
            &["route"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        Ok(Self {
            requests_total,
            pairings_total,
            waits_ended_total,
            wait_duration_seconds,
            players_waiting,
            queue_length,
            stale_tickets_purged_total,
            notifications_total,
        })
    }
}

impl SessionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let sessions_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_session_creations_total",
                "Session creation calls",
            ),
            &["status"],
        )?;
        registry.register(Box::new(sessions_total.clone()))?;

        let session_creation_duration = HistogramVec::new(
            HistogramOpts::new(
                "rendezvous_session_creation_duration_seconds",
                "Session creation latency",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0]),
            &["status"],
        )?;
        registry.register(Box::new(session_creation_duration.clone()))?;

        Ok(Self {
            sessions_total,
            session_creation_duration,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let find_match_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rendezvous_find_match_duration_seconds",
                "Time until find_match returns",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(find_match_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "rendezvous_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            find_match_duration,
            amqp_operation_duration,
        })
    }
}
