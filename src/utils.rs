//! Utility functions for the pairing service

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Time elapsed since `since`, clamped at zero for clock skew between instances
pub fn elapsed_since(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}

/// Timestamp `age` in the past, used as a staleness cutoff
pub fn cutoff_before(age: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(age) {
        Ok(age) => Utc::now() - age,
        Err(_) => DateTime::<Utc>::MIN_UTC,
    }
}
