//! Error taxonomy shared by every layer.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::types::{ErrorDetail, ErrorResponse, TransactionStatus};

/// Seconds a client is asked to wait after hitting an open breaker
pub const RETRY_AFTER_SECS: u64 = 30;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Business rejection; carries no dependency-health signal
    #[error("Rejected: {0}")]
    Rejected(#[from] RejectionError),

    /// Breaker refused the call without invoking the dependency
    #[error("Dependency '{breaker}' temporarily unavailable: {reason}")]
    DependencyUnavailable { breaker: String, reason: String },

    /// Dependency was invoked and failed
    #[error("Dependency '{breaker}' failed: {source}")]
    DependencyFailure {
        breaker: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True when the caller may retry later (open or saturated breaker)
    #[must_use]
    pub fn is_temporarily_unavailable(&self) -> bool {
        matches!(self, Self::DependencyUnavailable { .. })
    }

    /// True for business rejections
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Database(DatabaseError::NotFound(_)) => "not_found",
            Self::Database(_) => "database_error",
            Self::Validation(_) => "validation_error",
            Self::Rejected(RejectionError::AccountNotFound(_)) => "account_not_found",
            Self::Rejected(RejectionError::InsufficientBalance { .. }) => "insufficient_balance",
            Self::DependencyUnavailable { .. } => "temporarily_unavailable",
            Self::DependencyFailure { .. } => "dependency_failure",
            Self::Delivery(_) => "delivery_error",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Database(DatabaseError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Rejected(RejectionError::AccountNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Rejected(RejectionError::InsufficientBalance { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DependencyFailure { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details of 5xx failures stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorResponse {
            error: ErrorDetail {
                r#type: self.error_type().to_string(),
                message,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::Duplicate(db.message().to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Malformed requests
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },
    #[error("{0}")]
    Multiple(String),
}

/// Business rejections
#[derive(Debug, Error, PartialEq)]
pub enum RejectionError {
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },
    #[error("account {0} not found")]
    AccountNotFound(Uuid),
}

/// Event delivery failures; never surfaced to the business caller
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to serialize event: {0}")]
    Serialization(String),
    #[error("failed to deserialize outbox payload: {0}")]
    Deserialization(String),
    #[error("{failed}/{total} handlers failed for '{event_type}': {}", .errors.join("; "))]
    HandlersFailed {
        event_type: String,
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },
}

/// Attempted to leave a terminal transaction state
#[derive(Debug, Error, PartialEq)]
#[error("transaction {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: Uuid,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_maps_to_503_with_retry_after() {
        let err = AppError::DependencyUnavailable {
            breaker: "transaction->user".to_string(),
            reason: "circuit breaker is open".to_string(),
        };
        assert!(err.is_temporarily_unavailable());

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let retry_after = response.headers().get(header::RETRY_AFTER).unwrap();
        assert_eq!(retry_after.to_str().unwrap(), "30");
    }

    #[test]
    fn test_rejection_status_codes() {
        let insufficient = AppError::Rejected(RejectionError::InsufficientBalance {
            available: Decimal::new(5, 0),
            requested: Decimal::new(10, 0),
        });
        assert!(insufficient.is_rejection());
        assert_eq!(
            insufficient.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let missing = AppError::Rejected(RejectionError::AccountNotFound(Uuid::nil()));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_dependency_failure_keeps_source() {
        let err = AppError::DependencyFailure {
            breaker: "transaction->user".to_string(),
            source: Box::new(AppError::Database(DatabaseError::Connection(
                "refused".to_string(),
            ))),
        };
        assert!(err.to_string().contains("refused"));
        assert!(!err.is_temporarily_unavailable());
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_handlers_failed_message() {
        let err = DeliveryError::HandlersFailed {
            event_type: "deposit.completed".to_string(),
            failed: 2,
            total: 3,
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "2/3 handlers failed for 'deposit.completed': a; b"
        );
    }
}
