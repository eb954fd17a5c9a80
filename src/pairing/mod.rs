//! Pairing engine
//!
//! Matches waiting users two at a time through the shared queue. The
//! orchestrator owns the `find_match` flow; the registry, supervisor and
//! notifier handle the per-caller state around it.

pub mod notifier;
pub mod orchestrator;
pub mod pending;
pub mod registry;
pub mod stats;
pub mod supervisor;

pub use notifier::{
    Delivery, LocalMatchNotifier, MatchNotifier, NotificationListener, RedisMatchNotifier,
};
pub use orchestrator::{MatchOutcome, PairingConfig, PairingOrchestrator};
pub use pending::PendingMatch;
pub use registry::SubscriberRegistry;
pub use stats::PairingStats;
pub use supervisor::TimeoutSupervisor;
