//! The API layer, containing web handlers and routing.

pub mod admin;
pub mod handlers;
pub mod router;

pub use admin::{
    BreakerHealthResponse, BreakerStatesResponse, circuit_breaker_health_handler,
    circuit_breakers_handler,
};
pub use handlers::ApiDoc;
pub use router::{DEFAULT_REQUEST_TIMEOUT, create_router, create_router_with_timeout};
