//! Metrics and monitoring for the rendezvous service
//!
//! Prometheus collectors for the pairing engine and the HTTP server exposing
//! them next to the health probes.

pub mod collector;
pub mod health;

pub use collector::{
    MetricsCollector, MetricsTimer, PairingMetrics, PerformanceMetrics, ServiceMetrics,
    SessionMetrics,
};
pub use health::{metrics_text, HealthServer, HealthServerConfig};
