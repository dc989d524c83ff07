//! Application state management.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{BalanceRepository, LedgerUnitOfWork, OutboxStore, TransactionRepository};
use crate::infra::breaker::{BreakerRegistry, BreakerSettings};
use crate::infra::events::{DEFAULT_ASYNC_CONCURRENCY, EventBus};

use super::outbox::{DEFAULT_MAX_BACKOFF, OutboxRelay};
use super::service::LedgerService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LedgerService>,
    pub relay: Arc<OutboxRelay>,
    pub breakers: Arc<BreakerRegistry>,
    pub bus: Arc<EventBus>,
}

impl AppState {
    /// Wire every component on top of one store with default policies
    #[must_use]
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: BalanceRepository + TransactionRepository + OutboxStore + LedgerUnitOfWork + 'static,
    {
        Self::with_config(
            store,
            BreakerSettings::default(),
            DEFAULT_ASYNC_CONCURRENCY,
            DEFAULT_MAX_BACKOFF,
        )
    }

    #[must_use]
    pub fn with_config<S>(
        store: Arc<S>,
        breaker_settings: BreakerSettings,
        async_concurrency: usize,
        max_backoff: Duration,
    ) -> Self
    where
        S: BalanceRepository + TransactionRepository + OutboxStore + LedgerUnitOfWork + 'static,
    {
        let breakers = Arc::new(BreakerRegistry::new(breaker_settings));
        let bus = Arc::new(EventBus::new(async_concurrency));

        let service = Arc::new(LedgerService::new(
            Arc::clone(&store) as Arc<dyn BalanceRepository>,
            Arc::clone(&store) as Arc<dyn TransactionRepository>,
            Arc::clone(&store) as Arc<dyn LedgerUnitOfWork>,
            Arc::clone(&bus),
            Arc::clone(&breakers),
        ));
        let relay = Arc::new(
            OutboxRelay::new(store as Arc<dyn OutboxStore>, Arc::clone(&bus), Arc::clone(&breakers))
                .with_max_backoff(max_backoff),
        );

        Self {
            service,
            relay,
            breakers,
            bus,
        }
    }
}
