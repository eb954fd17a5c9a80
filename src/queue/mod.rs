//! Shared queue of waiting tickets
//!
//! The queue store is the only state visible across service instances.
//! `RedisQueueStore` is the production backend; `InMemoryQueueStore` serves
//! single-instance runs and tests.

pub mod memory;
pub mod redis_store;
pub mod scripts;
pub mod store;

pub use memory::InMemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use store::{Arrival, MatchAttempt, QueueStore};
