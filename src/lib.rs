//! Ledger backend with per-edge circuit breakers, an in-process event bus and
//! a transactional outbox.
//!
//! Layers:
//! - [`domain`]: types, events, repository traits and the error taxonomy
//! - [`infra`]: circuit breakers, the event bus, PostgreSQL and metrics
//! - [`app`]: the transaction orchestrator, outbox relay and background workers
//! - [`api`]: the axum adapter

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
