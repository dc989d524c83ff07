//! Event bus implementation.

pub mod bus;

pub use bus::{DEFAULT_ASYNC_CONCURRENCY, EventBus, EventHandler, FnHandler, handler_fn};
