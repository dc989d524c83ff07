//! PostgreSQL implementation of the ledger stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, Balance, BalanceChange, BalanceRepository, DatabaseError, LedgerCommit,
    LedgerUnitOfWork, OutboxRecord, OutboxStore, RejectionError, Transaction,
    TransactionRepository, TransactionStatus, TransitionError,
};

const TRANSACTION_COLUMNS: &str = "id, owner_id, counterparty_id, kind, amount, status, \
     reference_hash, error_message, created_at, updated_at, completed_at";

const OUTBOX_COLUMNS: &str = "id, aggregate_id, event_type, payload::text AS payload, attempts, \
     last_error, published, published_at, next_attempt_at, created_at";

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL client implementing every ledger store
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, AppError> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");

        Ok(Transaction {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            counterparty_id: row.get("counterparty_id"),
            kind: kind
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?,
            amount: row.get("amount"),
            status: status
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?,
            reference_hash: row.get("reference_hash"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn row_to_balance(row: &sqlx::postgres::PgRow) -> Balance {
        Balance {
            owner_id: row.get("owner_id"),
            amount: row.get("balance"),
            updated_at: row.get("updated_at"),
        }
    }

    fn row_to_outbox(row: &sqlx::postgres::PgRow) -> OutboxRecord {
        OutboxRecord {
            id: row.get("id"),
            aggregate_id: row.get("aggregate_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            published: row.get("published"),
            published_at: row.get("published_at"),
            next_attempt_at: row.get("next_attempt_at"),
            created_at: row.get("created_at"),
        }
    }

    /// Apply one guarded delta inside an open database transaction
    async fn apply_change(
        conn: &mut sqlx::PgConnection,
        change: &BalanceChange,
        now: DateTime<Utc>,
    ) -> Result<Balance, AppError> {
        let row = match change {
            BalanceChange::Credit { owner_id, amount } => sqlx::query(
                r#"
                UPDATE balances
                SET balance = balance + $1, updated_at = $2
                WHERE owner_id = $3
                RETURNING owner_id, balance, updated_at
                "#,
            )
            .bind(amount)
            .bind(now)
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from)?,
            BalanceChange::Debit { owner_id, amount } => sqlx::query(
                r#"
                UPDATE balances
                SET balance = balance - $1, updated_at = $2
                WHERE owner_id = $3 AND balance >= $1
                RETURNING owner_id, balance, updated_at
                "#,
            )
            .bind(amount)
            .bind(now)
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from)?,
        };

        if let Some(row) = row {
            return Ok(Self::row_to_balance(&row));
        }

        let available: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM balances WHERE owner_id = $1")
                .bind(change.owner_id())
                .fetch_optional(&mut *conn)
                .await
                .map_err(DatabaseError::from)?;

        Err(match available {
            Some(available) => RejectionError::InsufficientBalance {
                available,
                requested: change.amount(),
            },
            None => RejectionError::AccountNotFound(change.owner_id()),
        }
        .into())
    }

    async fn write_transaction(
        conn: &mut sqlx::PgConnection,
        tx: &Transaction,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, owner_id, counterparty_id, kind, amount, status,
                reference_hash, error_message, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                reference_hash = EXCLUDED.reference_hash,
                error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at,
                completed_at = EXCLUDED.completed_at
            WHERE transactions.status = 'pending'
            "#,
        )
        .bind(tx.id)
        .bind(tx.owner_id)
        .bind(tx.counterparty_id)
        .bind(tx.kind.as_str())
        .bind(tx.amount)
        .bind(tx.status.as_str())
        .bind(&tx.reference_hash)
        .bind(&tx.error_message)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.completed_at)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: String = sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1")
            .bind(tx.id)
            .fetch_one(&mut *conn)
            .await
            .map_err(DatabaseError::from)?;
        Err(TransitionError {
            id: tx.id,
            from: current.parse().unwrap_or(TransactionStatus::Failed),
            to: tx.status,
        }
        .into())
    }

    async fn insert_outbox(
        conn: &mut sqlx::PgConnection,
        record: &OutboxRecord,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO outbox (
                id, aggregate_id, event_type, payload, attempts, last_error,
                published, published_at, next_attempt_at, created_at
            )
            VALUES ($1, $2, $3, $4::jsonb, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.attempts)
        .bind(&record.last_error)
        .bind(record.published)
        .bind(record.published_at)
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }
}

#[async_trait]
impl BalanceRepository for PostgresClient {
    #[instrument(skip(self))]
    async fn find_by_owner(&self, owner_id: Uuid) -> Result<Option<Balance>, AppError> {
        let row = sqlx::query("SELECT owner_id, balance, updated_at FROM balances WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.as_ref().map(Self::row_to_balance))
    }

    #[instrument(skip(self))]
    async fn open_balance(&self, owner_id: Uuid) -> Result<Balance, AppError> {
        sqlx::query(
            r#"
            INSERT INTO balances (owner_id, balance, updated_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        let row = sqlx::query("SELECT owner_id, balance, updated_at FROM balances WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(Self::row_to_balance(&row))
    }
}

#[async_trait]
impl TransactionRepository for PostgresClient {
    #[instrument(skip(self, tx), fields(tx_id = %tx.id, owner_id = %tx.owner_id))]
    async fn create(&self, tx: &Transaction) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, owner_id, counterparty_id, kind, amount, status,
                reference_hash, error_message, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(tx.id)
        .bind(tx.owner_id)
        .bind(tx.counterparty_id)
        .bind(tx.kind.as_str())
        .bind(tx.amount)
        .bind(tx.status.as_str())
        .bind(&tx.reference_hash)
        .bind(&tx.error_message)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.completed_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(tx_id = %tx.id, status = %tx.status))]
    async fn update(&self, tx: &Transaction) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1, reference_hash = $2, error_message = $3,
                updated_at = $4, completed_at = $5
            WHERE id = $6
            "#,
        )
        .bind(tx.status.as_str())
        .bind(&tx.reference_hash)
        .bind(&tx.error_message)
        .bind(tx.updated_at)
        .bind(tx.completed_at)
        .bind(tx.id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("transaction {}", tx.id)).into());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1,
                error_message = COALESCE($2, error_message),
                updated_at = $3,
                completed_at = CASE WHEN $1 = 'completed' THEN $3 ELSE completed_at END
            WHERE id = $4 AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_owner(
        &self,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE owner_id = $1 OR counterparty_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(owner_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self))]
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        rows.iter().map(Self::row_to_transaction).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresClient {
    #[instrument(skip(self))]
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE published = FALSE
              AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        Ok(rows.iter().map(Self::row_to_outbox).collect())
    }

    #[instrument(skip(self))]
    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET published = TRUE, published_at = $1, last_error = NULL, next_attempt_at = NULL
            WHERE id = $2
            "#,
        )
        .bind(published_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = $1, next_attempt_at = $2
            WHERE id = $3
            "#,
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerUnitOfWork for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(
        skip(self, commit),
        fields(tx_id = %commit.transaction.id, status = %commit.transaction.status)
    )]
    async fn commit(&self, commit: &LedgerCommit) -> Result<Vec<Balance>, AppError> {
        let now = Utc::now();
        let mut db_tx: sqlx::Transaction<'_, Postgres> =
            self.pool.begin().await.map_err(DatabaseError::from)?;

        // Row locks are taken in owner order so opposing transfers cannot deadlock
        let mut order: Vec<usize> = (0..commit.balance_changes.len()).collect();
        order.sort_by_key(|&i| commit.balance_changes[i].owner_id());

        let mut balances: Vec<Option<Balance>> = vec![None; commit.balance_changes.len()];
        for i in order {
            let balance = Self::apply_change(&mut db_tx, &commit.balance_changes[i], now).await?;
            balances[i] = Some(balance);
        }

        Self::write_transaction(&mut db_tx, &commit.transaction).await?;
        for record in &commit.outbox {
            Self::insert_outbox(&mut db_tx, record).await?;
        }

        db_tx.commit().await.map_err(DatabaseError::from)?;
        Ok(balances.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_outbox_columns_cast_payload_to_text() {
        assert!(OUTBOX_COLUMNS.contains("payload::text AS payload"));
        assert!(!TRANSACTION_COLUMNS.contains("payload"));
    }
}
