//! Service layer for the rendezvous service
//!
//! Application state, backend wiring, background tasks and health checks.

pub mod app;
pub mod health;

pub use app::{AppState, ServiceError};
pub use health::{ComponentCheck, HealthCheck, HealthStatus, ServiceStats};
