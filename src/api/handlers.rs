//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::domain::{
    AmountRequest, AppError, Balance, ErrorDetail, ErrorResponse, HealthResponse, HealthStatus,
    Transaction, TransactionKind, TransactionReceipt, TransactionStatus, TransferFundsRequest,
    ValidationError,
};
use crate::infra::metrics;

use super::admin::{BreakerHealthResponse, BreakerStatesResponse};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Resilient Ledger API",
        version = "0.1.0",
        description = "Deposits, withdrawals and transfers guarded by circuit breakers, with durable event delivery",
        license(
            name = "MIT"
        )
    ),
    paths(
        open_account_handler,
        get_balance_handler,
        list_transactions_handler,
        deposit_handler,
        withdraw_handler,
        transfer_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
        super::admin::circuit_breakers_handler,
        super::admin::circuit_breaker_health_handler,
    ),
    components(
        schemas(
            Balance,
            Transaction,
            TransactionKind,
            TransactionStatus,
            TransactionReceipt,
            AmountRequest,
            TransferFundsRequest,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            BreakerStatesResponse,
            BreakerHealthResponse,
        )
    ),
    tags(
        (name = "accounts", description = "Balances and ledger operations"),
        (name = "health", description = "Health check endpoints"),
        (name = "admin", description = "Operational diagnostics")
    )
)]
pub struct ApiDoc;

/// Query parameters for transaction history
#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryParams {
    /// Maximum number of transactions to return (1-500, default: 50)
    pub limit: Option<i64>,
}

fn validate_body<T: Validate>(body: &T) -> Result<(), AppError> {
    body.validate()
        .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))
}

/// Open an account with a zero balance
///
/// Idempotent: an existing account is returned unchanged.
#[utoipa::path(
    post,
    path = "/accounts/{owner_id}",
    tag = "accounts",
    params(("owner_id" = Uuid, Path, description = "Account owner ID")),
    responses(
        (status = 200, description = "Account balance", body = Balance),
        (status = 503, description = "Balance store temporarily unavailable", body = ErrorResponse)
    )
)]
pub async fn open_account_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<Balance>, AppError> {
    let balance = state.service.open_account(owner_id).await?;
    Ok(Json(balance))
}

/// Current balance of an account
#[utoipa::path(
    get,
    path = "/accounts/{owner_id}/balance",
    tag = "accounts",
    params(("owner_id" = Uuid, Path, description = "Account owner ID")),
    responses(
        (status = 200, description = "Account balance", body = Balance),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 503, description = "Balance store temporarily unavailable", body = ErrorResponse)
    )
)]
pub async fn get_balance_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<Balance>, AppError> {
    let balance = state.service.balance(owner_id).await?;
    Ok(Json(balance))
}

/// Transactions involving an account, newest first
#[utoipa::path(
    get,
    path = "/accounts/{owner_id}/transactions",
    tag = "accounts",
    params(
        ("owner_id" = Uuid, Path, description = "Account owner ID"),
        HistoryParams
    ),
    responses(
        (status = 200, description = "Transaction history", body = Vec<Transaction>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_transactions_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Transaction>>, AppError> {
    let history = state
        .service
        .transaction_history(owner_id, params.limit)
        .await?;
    Ok(Json(history))
}

/// Deposit funds into an account
#[utoipa::path(
    post,
    path = "/accounts/{owner_id}/deposit",
    tag = "accounts",
    params(("owner_id" = Uuid, Path, description = "Account owner ID")),
    request_body = AmountRequest,
    responses(
        (status = 200, description = "Deposit completed", body = TransactionReceipt),
        (status = 400, description = "Invalid amount", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 502, description = "Balance store failed", body = ErrorResponse),
        (status = 503, description = "Balance store temporarily unavailable", body = ErrorResponse)
    )
)]
pub async fn deposit_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<Uuid>,
    Json(payload): Json<AmountRequest>,
) -> Result<Json<TransactionReceipt>, AppError> {
    validate_body(&payload)?;
    let receipt = state.service.deposit(owner_id, payload.amount).await?;
    Ok(Json(receipt))
}

/// Withdraw funds from an account
#[utoipa::path(
    post,
    path = "/accounts/{owner_id}/withdraw",
    tag = "accounts",
    params(("owner_id" = Uuid, Path, description = "Account owner ID")),
    request_body = AmountRequest,
    responses(
        (status = 200, description = "Withdrawal completed", body = TransactionReceipt),
        (status = 400, description = "Invalid amount", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 422, description = "Insufficient balance", body = ErrorResponse),
        (status = 503, description = "Balance store temporarily unavailable", body = ErrorResponse)
    )
)]
pub async fn withdraw_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<Uuid>,
    Json(payload): Json<AmountRequest>,
) -> Result<Json<TransactionReceipt>, AppError> {
    validate_body(&payload)?;
    let receipt = state.service.withdraw(owner_id, payload.amount).await?;
    Ok(Json(receipt))
}

/// Transfer funds to another account
#[utoipa::path(
    post,
    path = "/accounts/{owner_id}/transfer",
    tag = "accounts",
    params(("owner_id" = Uuid, Path, description = "Source account owner ID")),
    request_body = TransferFundsRequest,
    responses(
        (status = 200, description = "Transfer completed", body = TransactionReceipt),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 422, description = "Insufficient balance", body = ErrorResponse),
        (status = 503, description = "Balance store temporarily unavailable", body = ErrorResponse)
    )
)]
pub async fn transfer_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<Uuid>,
    Json(payload): Json<TransferFundsRequest>,
) -> Result<Json<TransactionReceipt>, AppError> {
    validate_body(&payload)?;
    let receipt = state
        .service
        .transfer(owner_id, payload.to_owner_id, payload.amount)
        .await?;
    Ok(Json(receipt))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
///
/// Open breakers degrade but do not fail readiness.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
