//! Running counters for the pairing engine

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::warn;

/// Counters since service start, per instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingStats {
    /// `find_match` calls received
    pub requests: u64,
    /// Calls rejected because the user was already waiting
    pub rejected: u64,
    /// Calls that found a partner on arrival
    pub immediate_pairings: u64,
    /// Calls that had to wait in the queue
    pub queued: u64,
    /// Waiting users paired by a later caller
    pub paired_while_waiting: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    /// Session creation failures, each failing both users
    pub failures: u64,
    /// Handles currently registered on this instance
    pub players_waiting: usize,
}

/// Shared, lock-guarded [`PairingStats`]
#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: RwLock<PairingStats>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` to the counters
    pub fn record(&self, update: impl FnOnce(&mut PairingStats)) {
        match self.stats.write() {
            Ok(mut stats) => update(&mut stats),
            Err(_) => warn!("Failed to acquire pairing stats lock, update dropped"),
        }
    }

    /// Copy of the counters
    pub fn snapshot(&self) -> PairingStats {
        self.stats
            .read()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let tracker = StatsTracker::new();
        tracker.record(|s| s.requests += 2);
        tracker.record(|s| s.timeouts += 1);

        let stats = tracker.snapshot();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.immediate_pairings, 0);
    }
}
