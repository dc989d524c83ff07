//! Circuit breakers and their registry.

pub mod circuit;
pub mod registry;

pub use circuit::{
    BreakerError, BreakerSettings, BreakerState, CircuitBreaker, Counts, StateChangeHook,
    TripPolicy, default_ready_to_trip,
};
pub use registry::{BreakerRegistry, edges};
