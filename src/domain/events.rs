//! Domain events emitted by the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{Transaction, TransactionKind};

pub const DEPOSIT_COMPLETED: &str = "deposit.completed";
pub const WITHDRAW_COMPLETED: &str = "withdraw.completed";
pub const TRANSFER_COMPLETED: &str = "transfer.completed";
pub const TRANSACTION_FAILED: &str = "transaction.failed";

/// Immutable fact published on the event bus and staged in the outbox.
///
/// The event id doubles as the outbox record id, so a subscriber that sees
/// the same id twice is seeing a redelivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event_type: String,
    /// Owning account of the transaction
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    DepositCompleted {
        transaction_id: Uuid,
        owner_id: Uuid,
        amount: Decimal,
        reference_hash: String,
    },
    WithdrawCompleted {
        transaction_id: Uuid,
        owner_id: Uuid,
        amount: Decimal,
        reference_hash: String,
    },
    TransferCompleted {
        transaction_id: Uuid,
        from_owner_id: Uuid,
        to_owner_id: Uuid,
        amount: Decimal,
        reference_hash: String,
    },
    TransactionFailed {
        transaction_id: Uuid,
        owner_id: Uuid,
        transaction_kind: TransactionKind,
        amount: Decimal,
        reason: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DepositCompleted { .. } => DEPOSIT_COMPLETED,
            Self::WithdrawCompleted { .. } => WITHDRAW_COMPLETED,
            Self::TransferCompleted { .. } => TRANSFER_COMPLETED,
            Self::TransactionFailed { .. } => TRANSACTION_FAILED,
        }
    }
}

impl DomainEvent {
    #[must_use]
    pub fn new(aggregate_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: payload.event_type().to_string(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Completion event for a finished deposit or withdrawal
    ///
    /// Returns `None` for transfers or transactions without a reference.
    pub fn balance_completed(tx: &Transaction) -> Option<Self> {
        let reference_hash = tx.reference_hash.clone()?;
        let payload = match tx.kind {
            TransactionKind::Deposit => EventPayload::DepositCompleted {
                transaction_id: tx.id,
                owner_id: tx.owner_id,
                amount: tx.amount,
                reference_hash,
            },
            TransactionKind::Withdraw => EventPayload::WithdrawCompleted {
                transaction_id: tx.id,
                owner_id: tx.owner_id,
                amount: tx.amount,
                reference_hash,
            },
            TransactionKind::Transfer => return None,
        };
        Some(Self::new(tx.owner_id.to_string(), payload))
    }

    pub fn transfer_completed(tx: &Transaction) -> Option<Self> {
        let payload = EventPayload::TransferCompleted {
            transaction_id: tx.id,
            from_owner_id: tx.owner_id,
            to_owner_id: tx.counterparty_id?,
            amount: tx.amount,
            reference_hash: tx.reference_hash.clone()?,
        };
        Some(Self::new(tx.owner_id.to_string(), payload))
    }

    #[must_use]
    pub fn transaction_failed(tx: &Transaction, reason: impl Into<String>) -> Self {
        Self::new(
            tx.owner_id.to_string(),
            EventPayload::TransactionFailed {
                transaction_id: tx.id,
                owner_id: tx.owner_id,
                transaction_kind: tx.kind,
                amount: tx.amount,
                reason: reason.into(),
            },
        )
    }
}
