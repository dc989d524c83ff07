//! Domain layer containing core business types, events, traits, and error definitions.

pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use error::{
    AppError, DatabaseError, DeliveryError, RejectionError, TransitionError, ValidationError,
};
pub use events::{DomainEvent, EventPayload};
pub use traits::{BalanceRepository, LedgerUnitOfWork, OutboxStore, TransactionRepository};
pub use types::{
    AmountRequest, Balance, BalanceChange, ErrorDetail, ErrorResponse, HealthResponse,
    HealthStatus, LedgerCommit, OutboxRecord, Transaction, TransactionKind, TransactionReceipt,
    TransactionStatus, TransferFundsRequest, check_amount,
};
