//! Ledger orchestration: balance mutations behind breakers, atomic
//! finalisation with outbox records, and event emission.

use chrono::Utc;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AppError, Balance, BalanceChange, BalanceRepository, DomainEvent, HealthResponse,
    HealthStatus, LedgerCommit, LedgerUnitOfWork, OutboxRecord, RejectionError, Transaction,
    TransactionKind, TransactionReceipt, TransactionRepository, TransactionStatus,
    ValidationError, check_amount,
};
use crate::infra::breaker::{BreakerRegistry, edges};
use crate::infra::events::EventBus;
use crate::infra::metrics;

/// Default page size for transaction history
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Transaction orchestrator
pub struct LedgerService {
    balances: Arc<dyn BalanceRepository>,
    transactions: Arc<dyn TransactionRepository>,
    ledger: Arc<dyn LedgerUnitOfWork>,
    bus: Arc<EventBus>,
    breakers: Arc<BreakerRegistry>,
}

impl LedgerService {
    #[must_use]
    pub fn new(
        balances: Arc<dyn BalanceRepository>,
        transactions: Arc<dyn TransactionRepository>,
        ledger: Arc<dyn LedgerUnitOfWork>,
        bus: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            balances,
            transactions,
            ledger,
            bus,
            breakers,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Credit `amount` to an existing account.
    ///
    /// The transaction is persisted as pending before the balance is read.
    /// Any failure after that finalises it as failed, staging a
    /// `transaction.failed` event.
    #[instrument(skip_all, fields(owner_id = %owner_id, amount = %amount))]
    pub async fn deposit(
        &self,
        owner_id: Uuid,
        amount: Decimal,
    ) -> Result<TransactionReceipt, AppError> {
        validate_amount(amount)?;

        let tx = Transaction::new(owner_id, TransactionKind::Deposit, amount);
        self.transactions.create(&tx).await?;

        if let Err(e) = self.require_balance(owner_id).await {
            self.record_failure(tx, &e).await;
            return Err(e);
        }

        let (commit, event) = Self::completion_commit(&tx)?;
        let commit = commit.with_change(BalanceChange::Credit { owner_id, amount });

        self.finish(tx, commit, event).await
    }

    /// Debit `amount` from an account.
    ///
    /// An insufficient balance is rejected before any transaction record is
    /// written and does not count against the balance store's breaker.
    #[instrument(skip_all, fields(owner_id = %owner_id, amount = %amount))]
    pub async fn withdraw(
        &self,
        owner_id: Uuid,
        amount: Decimal,
    ) -> Result<TransactionReceipt, AppError> {
        validate_amount(amount)?;

        let balance = self.require_balance(owner_id).await?;
        ensure_funds(&balance, amount)?;

        let tx = Transaction::new(owner_id, TransactionKind::Withdraw, amount);
        self.transactions.create(&tx).await?;

        let (commit, event) = Self::completion_commit(&tx)?;
        let commit = commit.with_change(BalanceChange::Debit { owner_id, amount });

        self.finish(tx, commit, event).await
    }

    /// Move `amount` between two accounts in one commit
    #[instrument(skip_all, fields(owner_id = %from, to = %to, amount = %amount))]
    pub async fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        amount: Decimal,
    ) -> Result<TransactionReceipt, AppError> {
        validate_amount(amount)?;
        if from == to {
            return Err(ValidationError::InvalidField {
                field: "to_owner_id".to_string(),
                message: "Cannot transfer to the same account".to_string(),
            }
            .into());
        }

        let source = self.require_balance(from).await?;
        self.require_balance(to).await?;
        ensure_funds(&source, amount)?;

        let tx = Transaction::transfer(from, to, amount);
        self.transactions.create(&tx).await?;

        let (commit, event) = Self::completion_commit(&tx)?;
        let commit = commit
            .with_change(BalanceChange::Debit {
                owner_id: from,
                amount,
            })
            .with_change(BalanceChange::Credit {
                owner_id: to,
                amount,
            });

        self.finish(tx, commit, event).await
    }

    /// Current balance of an account
    #[instrument(skip(self))]
    pub async fn balance(&self, owner_id: Uuid) -> Result<Balance, AppError> {
        self.require_balance(owner_id).await
    }

    /// Transactions involving the account, newest first
    #[instrument(skip(self))]
    pub async fn transaction_history(
        &self,
        owner_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Transaction>, AppError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
        self.transactions.find_by_owner(owner_id, limit).await
    }

    /// Create a zero balance for `owner_id`, or return the existing one
    #[instrument(skip(self))]
    pub async fn open_account(&self, owner_id: Uuid) -> Result<Balance, AppError> {
        let balances = Arc::clone(&self.balances);
        let balance = self
            .through_breaker(|| async move { balances.open_balance(owner_id).await })
            .await?;
        info!(owner_id = %owner_id, balance = %balance.amount, "Account opened");
        Ok(balance)
    }

    /// Fail transactions stuck in pending for longer than `stale_after`.
    ///
    /// Returns how many were moved to failed. Rows finalised concurrently
    /// are skipped.
    #[instrument(skip(self))]
    pub async fn fail_stale_transactions(
        &self,
        stale_after: Duration,
        limit: i64,
    ) -> Result<usize, AppError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| AppError::Internal(format!("invalid stale_after: {e}")))?;
        let stale = self.transactions.find_stale_pending(cutoff, limit).await?;

        let mut failed = 0;
        for tx in stale {
            let reason = format!("abandoned while pending for more than {}s", stale_after.as_secs());
            match self
                .transactions
                .update_status(tx.id, TransactionStatus::Failed, Some(&reason))
                .await
            {
                Ok(true) => {
                    warn!(tx_id = %tx.id, owner_id = %tx.owner_id, "Stale pending transaction failed");
                    metrics::try_record_transaction(tx.kind.as_str(), TransactionStatus::Failed.as_str());
                    failed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(tx_id = %tx.id, error = %e, "Failed to finalise stale transaction");
                }
            }
        }
        Ok(failed)
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let database = match self.ledger.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(database, self.breakers.open_breakers())
    }

    /// Complete a copy of the pending transaction and build the commit
    /// staging its completion event
    fn completion_commit(pending: &Transaction) -> Result<(LedgerCommit, DomainEvent), AppError> {
        let mut tx = pending.clone();
        tx.complete(tx.compute_reference_hash())?;
        let event = match tx.kind {
            TransactionKind::Transfer => DomainEvent::transfer_completed(&tx),
            _ => DomainEvent::balance_completed(&tx),
        }
        .ok_or_else(|| AppError::Internal(format!("transaction {} is not completed", tx.id)))?;

        let record = OutboxRecord::from_event(&event)?;
        Ok((LedgerCommit::new(tx).with_outbox(record), event))
    }

    /// Commit a completed transaction and announce it. On failure the
    /// pending transaction is finalised as failed instead.
    async fn finish(
        &self,
        pending: Transaction,
        commit: LedgerCommit,
        event: DomainEvent,
    ) -> Result<TransactionReceipt, AppError> {
        let ledger = Arc::clone(&self.ledger);
        let committed = {
            let commit = &commit;
            self.through_breaker(|| async move { ledger.commit(commit).await })
                .await
        };

        let balances = match committed {
            Ok(balances) => balances,
            Err(e) => {
                self.record_failure(pending, &e).await;
                return Err(e);
            }
        };

        let tx = commit.transaction;
        let balance = balances
            .into_iter()
            .find(|b| b.owner_id == tx.owner_id)
            .ok_or_else(|| AppError::Internal(format!("no balance returned for {}", tx.owner_id)))?;

        info!(
            tx_id = %tx.id,
            owner_id = %tx.owner_id,
            kind = %tx.kind,
            balance = %balance.amount,
            "Transaction completed"
        );

        // The outbox copy carries the same event id
        self.bus.publish_async(event);

        Ok(TransactionReceipt {
            transaction: tx,
            balance,
        })
    }

    /// Finalise a pending transaction as failed with a `transaction.failed`
    /// outbox record. Errors are logged; the stale crank retries later.
    async fn record_failure(&self, mut tx: Transaction, cause: &AppError) {
        if cause.is_rejection() {
            info!(tx_id = %tx.id, owner_id = %tx.owner_id, reason = %cause, "Transaction rejected");
        } else {
            warn!(tx_id = %tx.id, owner_id = %tx.owner_id, error = %cause, "Transaction failed");
        }

        let reason = cause.to_string();
        if let Err(e) = tx.fail(reason.clone()) {
            error!(tx_id = %tx.id, error = %e, "Cannot fail transaction");
            return;
        }

        let event = DomainEvent::transaction_failed(&tx, reason);
        let commit = match OutboxRecord::from_event(&event) {
            Ok(record) => LedgerCommit::new(tx.clone()).with_outbox(record),
            Err(e) => {
                error!(tx_id = %tx.id, error = %e, "Cannot stage failure event");
                LedgerCommit::new(tx.clone())
            }
        };

        if let Err(e) = self.ledger.commit(&commit).await {
            error!(
                tx_id = %tx.id,
                error = %e,
                "Failed to persist transaction failure; left pending"
            );
        }
    }

    /// Balance lookup through the `transaction->user` breaker
    async fn fetch_balance(&self, owner_id: Uuid) -> Result<Option<Balance>, AppError> {
        let balances = Arc::clone(&self.balances);
        self.through_breaker(|| async move { balances.find_by_owner(owner_id).await })
            .await
    }

    /// Like `fetch_balance`; a missing account is a rejection decided after
    /// the breaker has recorded a success
    async fn require_balance(&self, owner_id: Uuid) -> Result<Balance, AppError> {
        self.fetch_balance(owner_id)
            .await?
            .ok_or_else(|| RejectionError::AccountNotFound(owner_id).into())
    }

    /// Run a balance-store call through the `transaction->user` breaker.
    ///
    /// Rejections and invalid transitions are reported to the breaker as
    /// successes and returned unchanged.
    async fn through_breaker<T, F, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let breaker = self.breakers.get_breaker(edges::TRANSACTION_USER);
        breaker
            .execute(|| async move {
                match operation().await {
                    Err(e) if e.is_rejection() || matches!(e, AppError::InvalidTransition(_)) => {
                        Ok(Err(e))
                    }
                    other => other.map(Ok),
                }
            })
            .await?
    }
}

fn validate_amount(amount: Decimal) -> Result<(), AppError> {
    check_amount(&amount).map_err(|message| {
        ValidationError::InvalidField {
            field: "amount".to_string(),
            message: message.to_string(),
        }
        .into()
    })
}

fn ensure_funds(balance: &Balance, amount: Decimal) -> Result<(), AppError> {
    if balance.amount < amount {
        info!(
            owner_id = %balance.owner_id,
            available = %balance.amount,
            requested = %amount,
            "Insufficient balance"
        );
        return Err(RejectionError::InsufficientBalance {
            available: balance.amount,
            requested: amount,
        }
        .into());
    }
    Ok(())
}
