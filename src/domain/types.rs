//! Domain types with validation support.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::error::{AppError, DeliveryError, TransitionError};
use super::events::DomainEvent;

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Transfer => "transfer",
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdraw" => Ok(Self::Withdraw),
            "transfer" => Ok(Self::Transfer),
            _ => Err(format!("Invalid transaction kind: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, balance not yet touched
    #[default]
    Pending,
    /// Balance mutated; terminal
    Completed,
    /// Aborted; terminal
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger transaction aggregate
///
/// Status only moves forward: pending → completed or pending → failed.
/// `completed_at` is set exactly when the status is completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Transaction {
    pub id: Uuid,
    /// Account that owns the transaction (source account for transfers)
    pub owner_id: Uuid,
    /// Destination account of a transfer
    pub counterparty_id: Option<Uuid>,
    pub kind: TransactionKind,
    #[schema(value_type = String, example = "100.50")]
    pub amount: Decimal,
    pub status: TransactionStatus,
    /// External reference, set on completion
    pub reference_hash: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    #[must_use]
    pub fn new(owner_id: Uuid, kind: TransactionKind, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            counterparty_id: None,
            kind,
            amount,
            status: TransactionStatus::Pending,
            reference_hash: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn transfer(from: Uuid, to: Uuid, amount: Decimal) -> Self {
        let mut tx = Self::new(from, TransactionKind::Transfer, amount);
        tx.counterparty_id = Some(to);
        tx
    }

    /// Deterministic hex SHA-256 over the identifying fields
    #[must_use]
    pub fn compute_reference_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.id.as_bytes());
        hasher.update(self.amount.to_string().as_bytes());
        hasher.update(self.created_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Move to completed with the given reference
    pub fn complete(&mut self, reference_hash: String) -> Result<(), TransitionError> {
        self.guard_transition(TransactionStatus::Completed)?;
        let now = Utc::now();
        self.status = TransactionStatus::Completed;
        self.reference_hash = Some(reference_hash);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Move to failed, recording the reason
    pub fn fail(&mut self, error_message: impl Into<String>) -> Result<(), TransitionError> {
        self.guard_transition(TransactionStatus::Failed)?;
        self.status = TransactionStatus::Failed;
        self.error_message = Some(error_message.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    fn guard_transition(&self, to: TransactionStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

/// Account balance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Balance {
    pub owner_id: Uuid,
    #[schema(value_type = String, example = "250.00")]
    pub amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    #[must_use]
    pub fn new(owner_id: Uuid, amount: Decimal) -> Self {
        Self {
            owner_id,
            amount,
            updated_at: Utc::now(),
        }
    }
}

/// Guarded balance delta applied inside a [`LedgerCommit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceChange {
    Credit { owner_id: Uuid, amount: Decimal },
    /// Rejected by the store if it would drive the balance negative
    Debit { owner_id: Uuid, amount: Decimal },
}

impl BalanceChange {
    pub fn owner_id(&self) -> Uuid {
        match self {
            Self::Credit { owner_id, .. } | Self::Debit { owner_id, .. } => *owner_id,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Self::Credit { amount, .. } | Self::Debit { amount, .. } => *amount,
        }
    }

    /// Signed delta to add to the current balance
    pub fn signed_amount(&self) -> Decimal {
        match self {
            Self::Credit { amount, .. } => *amount,
            Self::Debit { amount, .. } => -*amount,
        }
    }
}

/// One durable unit of work: balance deltas, the transaction's new state and
/// the outbox records describing it, committed together or not at all.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    pub transaction: Transaction,
    pub balance_changes: Vec<BalanceChange>,
    pub outbox: Vec<OutboxRecord>,
}

impl LedgerCommit {
    #[must_use]
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            balance_changes: Vec::new(),
            outbox: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_change(mut self, change: BalanceChange) -> Self {
        self.balance_changes.push(change);
        self
    }

    #[must_use]
    pub fn with_outbox(mut self, record: OutboxRecord) -> Self {
        self.outbox.push(record);
        self
    }
}

/// Undelivered event staged for the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    /// JSON-serialized [`DomainEvent`]
    pub payload: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    /// Earliest time the relay may retry; `None` means immediately
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Stage an event, keeping its id so consumers can deduplicate
    pub fn from_event(event: &DomainEvent) -> Result<Self, AppError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| DeliveryError::Serialization(e.to_string()))?;
        Ok(Self {
            id: event.id,
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload,
            attempts: 0,
            last_error: None,
            published: false,
            published_at: None,
            next_attempt_at: None,
            created_at: Utc::now(),
        })
    }
}

/// Result of a finished ledger operation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionReceipt {
    pub transaction: Transaction,
    /// Balance of the owning account after the commit
    pub balance: Balance,
}

/// Fractional digits stored by the `NUMERIC(38, 18)` amount columns
pub const AMOUNT_SCALE: u32 = 18;

/// Exclusive upper bound on amounts: 20 integer digits
#[must_use]
pub fn amount_ceiling() -> Decimal {
    Decimal::from_i128_with_scale(100_000_000_000_000_000_000, 0)
}

/// Check that `amount` is positive and storable without rounding
pub fn check_amount(amount: &Decimal) -> Result<(), &'static str> {
    if !amount.is_sign_positive() || amount.is_zero() {
        return Err("Amount must be greater than 0");
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err("Amount has more than 18 decimal places");
    }
    if *amount >= amount_ceiling() {
        return Err("Amount exceeds 20 integer digits");
    }
    Ok(())
}

fn validate_positive_amount(amount: &Decimal) -> Result<(), validator::ValidationError> {
    check_amount(amount).map_err(|message| {
        let mut err = validator::ValidationError::new("amount");
        err.message = Some(message.into());
        err
    })
}

/// Deposit or withdraw request body
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct AmountRequest {
    #[validate(custom(function = "validate_positive_amount"))]
    #[schema(value_type = String, example = "100.50")]
    pub amount: Decimal,
}

impl AmountRequest {
    #[must_use]
    pub fn new(amount: Decimal) -> Self {
        Self { amount }
    }
}

/// Transfer request body
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct TransferFundsRequest {
    pub to_owner_id: Uuid,
    #[validate(custom(function = "validate_positive_amount"))]
    #[schema(value_type = String, example = "25.00")]
    pub amount: Decimal,
}

impl TransferFundsRequest {
    #[must_use]
    pub fn new(to_owner_id: Uuid, amount: Decimal) -> Self {
        Self {
            to_owner_id,
            amount,
        }
    }
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Database health status
    pub database: HealthStatus,
    /// Degraded when any breaker is open
    pub breakers: HealthStatus,
    /// Names of breakers currently open
    pub open_breakers: Vec<String>,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, open_breakers: Vec<String>) -> Self {
        let breakers = if open_breakers.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        let status = match (&database, &breakers) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            breakers,
            open_breakers,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "insufficient_balance")]
    pub r#type: String,
    /// Human-readable error message
    pub message: String,
}
