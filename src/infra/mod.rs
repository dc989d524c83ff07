//! Infrastructure layer implementations.

pub mod breaker;
pub mod database;
pub mod events;
pub mod metrics;

pub use breaker::{BreakerRegistry, BreakerSettings, BreakerState, CircuitBreaker};
pub use database::{PostgresClient, PostgresConfig};
pub use events::{EventBus, EventHandler, handler_fn};
