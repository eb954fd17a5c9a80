//! AMQP integration for the pairing service
//!
//! Connection management, the event publisher for pairing events, and the
//! message formats shared with the chat service.

pub mod connection;
pub mod messages;
pub mod publisher;

// Re-export commonly used types
pub use connection::{AmqpConfig, AmqpConnection};
pub use messages::*;
pub use publisher::{AmqpEventPublisher, EventPublisher, LogEventPublisher, MockEventPublisher};
