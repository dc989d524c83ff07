//! Named breakers, one per dependency edge.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::circuit::{BreakerSettings, BreakerState, CircuitBreaker};

/// Breaker names, written as `caller->callee`
pub mod edges {
    /// Balance lookups made by the transaction orchestrator
    pub const TRANSACTION_USER: &str = "transaction->user";
    /// Pending-record fetches made by the outbox relay
    pub const OUTBOX_DATABASE: &str = "outbox->database";
}

/// Process-wide set of breakers, shared by handle.
///
/// Creation is atomic per name: concurrent first references get the same
/// instance.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: BreakerSettings,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    /// Get or create `name` with the default policy
    pub fn get_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_breaker(name, self.defaults.clone())
    }

    /// Get or create `name`; `settings` only apply if this call creates it
    pub fn get_or_create_breaker(&self, name: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        let mut created = false;
        let breaker = Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(CircuitBreaker::new(name, settings))
                })
                .value(),
        );
        if created {
            info!(breaker = %name, "Circuit breaker created");
        }
        breaker
    }

    /// Name to state string, sorted by name
    pub fn get_all_states(&self) -> BTreeMap<String, String> {
        self.snapshot()
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.state().to_string()))
            .collect()
    }

    /// Names of breakers currently open, sorted
    pub fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|breaker| breaker.state() == BreakerState::Open)
            .map(|breaker| breaker.name().to_string())
            .collect();
        open.sort();
        open
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    // State reads may fire hooks, so no map shard is held while reading
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
