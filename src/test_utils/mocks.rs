//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{
    AppError, Balance, BalanceChange, BalanceRepository, DatabaseError, DomainEvent,
    LedgerCommit, LedgerUnitOfWork, OutboxRecord, OutboxStore, RejectionError, Transaction,
    TransactionRepository, TransactionStatus, TransitionError,
};
use crate::infra::events::EventHandler;

#[derive(Debug, Default)]
struct Tables {
    balances: HashMap<Uuid, Balance>,
    transactions: HashMap<Uuid, Transaction>,
    outbox: Vec<OutboxRecord>,
}

/// In-memory ledger store implementing every repository trait.
///
/// All tables sit behind one lock so `commit` is atomic. Each operation
/// group can be switched to fail with a connection error.
#[derive(Debug)]
pub struct MockLedgerStore {
    tables: Mutex<Tables>,
    is_healthy: AtomicBool,
    fail_balance_lookups: AtomicBool,
    fail_commits: AtomicBool,
    fail_outbox_fetch: AtomicBool,
    balance_lookups: AtomicUsize,
    commits: AtomicUsize,
}

impl MockLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            is_healthy: AtomicBool::new(true),
            fail_balance_lookups: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            fail_outbox_fetch: AtomicBool::new(false),
            balance_lookups: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    /// Store with one account already funded
    #[must_use]
    pub fn with_balance(owner_id: Uuid, amount: Decimal) -> Self {
        let store = Self::new();
        store.seed_balance(owner_id, amount);
        store
    }

    pub fn seed_balance(&self, owner_id: Uuid, amount: Decimal) {
        self.tables()
            .balances
            .insert(owner_id, Balance::new(owner_id, amount));
    }

    /// Insert a transaction as-is, e.g. with a back-dated `created_at`
    pub fn seed_transaction(&self, tx: Transaction) {
        self.tables().transactions.insert(tx.id, tx);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_fail_balance_lookups(&self, fail: bool) {
        self.fail_balance_lookups.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_outbox_fetch(&self, fail: bool) {
        self.fail_outbox_fetch.store(fail, Ordering::Relaxed);
    }

    /// Balance lookups attempted, including failed ones
    pub fn balance_lookups(&self) -> usize {
        self.balance_lookups.load(Ordering::Relaxed)
    }

    /// Commits attempted, including failed ones
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn balance_of(&self, owner_id: Uuid) -> Option<Decimal> {
        self.tables().balances.get(&owner_id).map(|b| b.amount)
    }

    pub fn transaction(&self, id: Uuid) -> Option<Transaction> {
        self.tables().transactions.get(&id).cloned()
    }

    /// All transactions, oldest first
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut all: Vec<Transaction> = self.tables().transactions.values().cloned().collect();
        all.sort_by_key(|tx| (tx.created_at, tx.id));
        all
    }

    /// All outbox records in insertion order
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.tables().outbox.clone()
    }

    /// Make every failed record due now
    pub fn expire_backoff(&self) {
        for record in &mut self.tables().outbox {
            record.next_attempt_at = None;
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), AppError> {
        if flag.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(format!(
                "mock {what} unavailable"
            ))));
        }
        Ok(())
    }

    fn apply(
        balances: &mut HashMap<Uuid, Balance>,
        change: &BalanceChange,
        now: DateTime<Utc>,
    ) -> Result<Balance, AppError> {
        let balance = balances
            .get_mut(&change.owner_id())
            .ok_or(RejectionError::AccountNotFound(change.owner_id()))?;
        let next = balance.amount + change.signed_amount();
        if next < Decimal::ZERO {
            return Err(RejectionError::InsufficientBalance {
                available: balance.amount,
                requested: change.amount(),
            }
            .into());
        }
        balance.amount = next;
        balance.updated_at = now;
        Ok(balance.clone())
    }
}

impl Default for MockLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceRepository for MockLedgerStore {
    async fn find_by_owner(&self, owner_id: Uuid) -> Result<Option<Balance>, AppError> {
        self.balance_lookups.fetch_add(1, Ordering::Relaxed);
        Self::check(&self.fail_balance_lookups, "balance store")?;
        Ok(self.tables().balances.get(&owner_id).cloned())
    }

    async fn open_balance(&self, owner_id: Uuid) -> Result<Balance, AppError> {
        Self::check(&self.fail_balance_lookups, "balance store")?;
        Ok(self
            .tables()
            .balances
            .entry(owner_id)
            .or_insert_with(|| Balance::new(owner_id, Decimal::ZERO))
            .clone())
    }
}

#[async_trait]
impl TransactionRepository for MockLedgerStore {
    async fn create(&self, tx: &Transaction) -> Result<(), AppError> {
        let mut tables = self.tables();
        if tables.transactions.contains_key(&tx.id) {
            return Err(DatabaseError::Duplicate(tx.id.to_string()).into());
        }
        tables.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update(&self, tx: &Transaction) -> Result<(), AppError> {
        let mut tables = self.tables();
        match tables.transactions.get_mut(&tx.id) {
            Some(stored) => {
                *stored = tx.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("transaction {}", tx.id)).into()),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables();
        let Some(tx) = tables.transactions.get_mut(&id) else {
            return Ok(false);
        };
        if tx.status != TransactionStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        tx.status = status;
        if let Some(message) = error_message {
            tx.error_message = Some(message.to_string());
        }
        tx.updated_at = now;
        if status == TransactionStatus::Completed {
            tx.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, AppError> {
        Ok(self.tables().transactions.get(&id).cloned())
    }

    async fn find_by_owner(
        &self,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let mut matching: Vec<Transaction> = self
            .tables()
            .transactions
            .values()
            .filter(|tx| tx.owner_id == owner_id || tx.counterparty_id == Some(owner_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let mut stale: Vec<Transaction> = self
            .tables()
            .transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|tx| tx.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait]
impl OutboxStore for MockLedgerStore {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>, AppError> {
        Self::check(&self.fail_outbox_fetch, "outbox")?;
        let now = Utc::now();
        let mut due: Vec<OutboxRecord> = self
            .tables()
            .outbox
            .iter()
            .filter(|r| !r.published && r.next_attempt_at.is_none_or(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.created_at, r.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> Result<(), AppError> {
        let mut tables = self.tables();
        if let Some(record) = tables.outbox.iter_mut().find(|r| r.id == id) {
            record.published = true;
            record.published_at = Some(published_at);
            record.last_error = None;
            record.next_attempt_at = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut tables = self.tables();
        if let Some(record) = tables.outbox.iter_mut().find(|r| r.id == id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerUnitOfWork for MockLedgerStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        Ok(())
    }

    async fn commit(&self, commit: &LedgerCommit) -> Result<Vec<Balance>, AppError> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Self::check(&self.fail_commits, "ledger")?;

        let mut tables = self.tables();
        let tx = &commit.transaction;
        if let Some(stored) = tables.transactions.get(&tx.id) {
            if stored.status != TransactionStatus::Pending {
                return Err(TransitionError {
                    id: tx.id,
                    from: stored.status,
                    to: tx.status,
                }
                .into());
            }
        }

        // Work on a copy so a rejected change leaves nothing behind
        let now = Utc::now();
        let mut balances = tables.balances.clone();
        let mut results = Vec::with_capacity(commit.balance_changes.len());
        for change in &commit.balance_changes {
            results.push(Self::apply(&mut balances, change, now)?);
        }

        tables.balances = balances;
        tables.transactions.insert(tx.id, tx.clone());
        tables.outbox.extend(commit.outbox.iter().cloned());
        Ok(results)
    }
}

/// Event handler that records every event it receives
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    events: Mutex<Vec<DomainEvent>>,
    failing: AtomicBool,
}

impl RecordingHandler {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Handler that records and then fails every event
    #[must_use]
    pub fn failing(name: impl Into<String>) -> Self {
        let handler = Self::new(name);
        handler.set_failing(true);
        handler
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("{} rejected {}", self.name, event.event_type);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionKind;

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let rich = Uuid::new_v4();
        let poor = Uuid::new_v4();
        let store = MockLedgerStore::with_balance(rich, Decimal::new(100, 0));
        store.seed_balance(poor, Decimal::new(5, 0));

        let tx = Transaction::transfer(poor, rich, Decimal::new(10, 0));
        let commit = LedgerCommit::new(tx.clone())
            .with_change(BalanceChange::Credit {
                owner_id: rich,
                amount: Decimal::new(10, 0),
            })
            .with_change(BalanceChange::Debit {
                owner_id: poor,
                amount: Decimal::new(10, 0),
            });

        let err = store.commit(&commit).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Rejected(RejectionError::InsufficientBalance { .. })
        ));
        assert_eq!(store.balance_of(rich), Some(Decimal::new(100, 0)));
        assert!(store.transaction(tx.id).is_none());
    }

    #[tokio::test]
    async fn test_commit_refuses_terminal_transaction() {
        let owner = Uuid::new_v4();
        let store = MockLedgerStore::with_balance(owner, Decimal::ZERO);
        let mut tx = Transaction::new(owner, TransactionKind::Deposit, Decimal::ONE);
        tx.fail("boom").unwrap();
        store.seed_transaction(tx.clone());

        let mut retry = tx.clone();
        retry.status = TransactionStatus::Completed;
        let err = store.commit(&LedgerCommit::new(retry)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_recording_handler_failure() {
        let handler = RecordingHandler::failing("audit");
        let tx = Transaction::new(Uuid::new_v4(), TransactionKind::Deposit, Decimal::ONE);
        let event = DomainEvent::transaction_failed(&tx, "down");
        assert!(handler.handle(&event).await.is_err());
        assert_eq!(handler.count(), 1);
    }
}
