//! Domain traits defining contracts for the ledger's stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::AppError;
use super::types::{Balance, LedgerCommit, OutboxRecord, Transaction, TransactionStatus};

/// Balance store
#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Current balance, or `None` when the account does not exist
    async fn find_by_owner(&self, owner_id: Uuid) -> Result<Option<Balance>, AppError>;

    /// Create a zero balance unless one exists, then return the stored one.
    ///
    /// Never overwrites an existing balance.
    async fn open_balance(&self, owner_id: Uuid) -> Result<Balance, AppError>;
}

/// Transaction store
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn create(&self, tx: &Transaction) -> Result<(), AppError>;

    /// Overwrite a stored transaction
    async fn update(&self, tx: &Transaction) -> Result<(), AppError>;

    /// Move a pending transaction to a terminal status.
    ///
    /// Returns `false` when the transaction was no longer pending.
    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, AppError>;

    /// Transactions owned by or transferred to the account, newest first
    async fn find_by_owner(&self, owner_id: Uuid, limit: i64)
    -> Result<Vec<Transaction>, AppError>;

    /// Pending transactions created before `older_than`
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError>;
}

/// Durable store of undelivered events
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished records that are due, oldest first
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>, AppError>;

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>)
    -> Result<(), AppError>;

    /// Record a failed delivery attempt and increment `attempts`
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;
}

/// Atomic writer for a whole ledger operation
#[async_trait]
pub trait LedgerUnitOfWork: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Apply balance changes, persist the transaction and insert outbox
    /// records in one atomic step.
    ///
    /// Fails with `RejectionError::InsufficientBalance` if a debit would
    /// drive a balance negative, and with `TransitionError` if the stored
    /// transaction is already terminal. On failure nothing is written.
    /// Returns the resulting balances in the order of `balance_changes`.
    async fn commit(&self, commit: &LedgerCommit) -> Result<Vec<Balance>, AppError>;
}
