//! Application layer containing business logic and shared state.

pub mod outbox;
pub mod service;
pub mod state;
pub mod subscribers;
pub mod worker;

pub use outbox::{BatchReport, OutboxRelay};
pub use service::LedgerService;
pub use state::AppState;
pub use subscribers::{LedgerEventLogger, register_default_subscribers};
pub use worker::{CrankConfig, OutboxRelayConfig, spawn_outbox_relay, spawn_stale_crank};
