//! Default event subscribers.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::events::{
    DEPOSIT_COMPLETED, TRANSACTION_FAILED, TRANSFER_COMPLETED, WITHDRAW_COMPLETED,
};
use crate::domain::{DomainEvent, EventPayload};
use crate::infra::events::{EventBus, EventHandler};
use crate::infra::metrics;

/// Event ids remembered for duplicate suppression
const SEEN_CAPACITY: usize = 4096;

/// Bounded set of recently handled event ids
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl RecentIds {
    /// Returns false if `id` was already seen
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Logs every ledger event once and counts it in `ledger_transactions_total`.
///
/// Each event normally arrives twice, once from the immediate async publish
/// and once from the outbox relay; repeats are dropped by event id.
#[derive(Debug, Default)]
pub struct LedgerEventLogger {
    seen: Mutex<RecentIds>,
}

impl LedgerEventLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventHandler for LedgerEventLogger {
    fn name(&self) -> &str {
        "ledger-event-logger"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        let first = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.id);
        if !first {
            return Ok(());
        }

        match &event.payload {
            EventPayload::DepositCompleted {
                transaction_id,
                owner_id,
                amount,
                ..
            } => {
                info!(event_id = %event.id, tx_id = %transaction_id, owner_id = %owner_id, amount = %amount, "Deposit completed");
                metrics::try_record_transaction("deposit", "completed");
            }
            EventPayload::WithdrawCompleted {
                transaction_id,
                owner_id,
                amount,
                ..
            } => {
                info!(event_id = %event.id, tx_id = %transaction_id, owner_id = %owner_id, amount = %amount, "Withdrawal completed");
                metrics::try_record_transaction("withdraw", "completed");
            }
            EventPayload::TransferCompleted {
                transaction_id,
                from_owner_id,
                to_owner_id,
                amount,
                ..
            } => {
                info!(
                    event_id = %event.id,
                    tx_id = %transaction_id,
                    owner_id = %from_owner_id,
                    to = %to_owner_id,
                    amount = %amount,
                    "Transfer completed"
                );
                metrics::try_record_transaction("transfer", "completed");
            }
            EventPayload::TransactionFailed {
                transaction_id,
                owner_id,
                transaction_kind,
                reason,
                ..
            } => {
                warn!(event_id = %event.id, tx_id = %transaction_id, owner_id = %owner_id, kind = %transaction_kind, reason = %reason, "Transaction failed");
                metrics::try_record_transaction(transaction_kind.as_str(), "failed");
            }
        }
        Ok(())
    }
}

/// Subscribe the default handlers to every ledger event type
pub fn register_default_subscribers(bus: &EventBus) {
    let logger: Arc<dyn EventHandler> = Arc::new(LedgerEventLogger::new());
    for event_type in [
        DEPOSIT_COMPLETED,
        WITHDRAW_COMPLETED,
        TRANSFER_COMPLETED,
        TRANSACTION_FAILED,
    ] {
        bus.subscribe(event_type, Arc::clone(&logger));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut recent = RecentIds::default();
        let first = Uuid::new_v4();
        assert!(recent.insert(first));
        assert!(!recent.insert(first));

        for _ in 0..SEEN_CAPACITY {
            recent.insert(Uuid::new_v4());
        }
        assert_eq!(recent.ids.len(), SEEN_CAPACITY);
        assert!(recent.insert(first));
    }

    #[test]
    fn test_default_subscribers_cover_every_event_type() {
        let bus = EventBus::default();
        register_default_subscribers(&bus);
        for event_type in [
            DEPOSIT_COMPLETED,
            WITHDRAW_COMPLETED,
            TRANSFER_COMPLETED,
            TRANSACTION_FAILED,
        ] {
            assert_eq!(bus.handler_count(event_type), 1);
        }
    }
}
