//! HTTP router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{Method, StatusCode, header},
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;

use super::admin::{circuit_breaker_health_handler, circuit_breakers_handler};
use super::handlers::{
    ApiDoc, deposit_handler, get_balance_handler, health_check_handler, list_transactions_handler,
    liveness_handler, metrics_handler, open_account_handler, readiness_handler, transfer_handler,
    withdraw_handler,
};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request bodies above this size are refused
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Build the router with the default request timeout
pub fn create_router(state: Arc<AppState>) -> Router {
    create_router_with_timeout(state, DEFAULT_REQUEST_TIMEOUT)
}

/// Build the router with every route, Swagger UI and the middleware stack
pub fn create_router_with_timeout(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let accounts = Router::new()
        .route("/accounts/{owner_id}", post(open_account_handler))
        .route("/accounts/{owner_id}/balance", get(get_balance_handler))
        .route(
            "/accounts/{owner_id}/transactions",
            get(list_transactions_handler),
        )
        .route("/accounts/{owner_id}/deposit", post(deposit_handler))
        .route("/accounts/{owner_id}/withdraw", post(withdraw_handler))
        .route("/accounts/{owner_id}/transfer", post(transfer_handler));

    let operations = Router::new()
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/admin/circuit-breakers", get(circuit_breakers_handler))
        .route(
            "/admin/circuit-breakers/health",
            get(circuit_breaker_health_handler),
        )
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(accounts)
        .merge(operations)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .with_state(state)
}
