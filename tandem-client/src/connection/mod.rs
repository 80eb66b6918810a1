//! Connection resilience layer
//!
//! Reconnect with capped exponential backoff, a circuit breaker on connect
//! failures, a bounded outbound queue and health metrics, all driven by
//! [`ConnectionManager`].

pub mod backoff;
pub mod breaker;
pub mod health;
pub mod manager;
pub mod queue;
pub mod state;
pub mod transport;

pub use backoff::Backoff;
pub use breaker::{BreakerState, CircuitBreaker};
pub use health::{ConnectionQuality, HealthMetrics, HealthSnapshot};
pub use manager::{ConnectionEvent, ConnectionManager};
pub use queue::{MessageQueue, QueuedMessage};
pub use state::ConnectionState;
pub use transport::{Connector, Transport, WsConnector, WsTransport};
