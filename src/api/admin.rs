//! Admin API handlers for circuit breaker diagnostics.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::app::AppState;

/// Every known breaker and its state
#[derive(Debug, Serialize, ToSchema)]
pub struct BreakerStatesResponse {
    /// Breaker name to `closed`, `half-open` or `open`
    pub breakers: BTreeMap<String, String>,
    /// Meaning of each state value
    pub legend: BTreeMap<String, String>,
}

/// Breaker health summary
#[derive(Debug, Serialize, ToSchema)]
pub struct BreakerHealthResponse {
    pub healthy: bool,
    /// Names of breakers currently rejecting calls
    pub open_breakers: Vec<String>,
}

fn state_legend() -> BTreeMap<String, String> {
    [
        ("closed", "Calls flow normally; failures are counted"),
        ("half-open", "A bounded number of trial calls probe recovery"),
        ("open", "Calls are rejected until the open timeout elapses"),
    ]
    .into_iter()
    .map(|(state, meaning)| (state.to_string(), meaning.to_string()))
    .collect()
}

/// List every circuit breaker with its current state
///
/// GET /admin/circuit-breakers
#[utoipa::path(
    get,
    path = "/admin/circuit-breakers",
    tag = "admin",
    responses(
        (status = 200, description = "Breaker states", body = BreakerStatesResponse),
    )
)]
pub async fn circuit_breakers_handler(
    State(state): State<Arc<AppState>>,
) -> Json<BreakerStatesResponse> {
    Json(BreakerStatesResponse {
        breakers: state.breakers.get_all_states(),
        legend: state_legend(),
    })
}

/// Report whether any breaker is open
///
/// GET /admin/circuit-breakers/health
#[utoipa::path(
    get,
    path = "/admin/circuit-breakers/health",
    tag = "admin",
    responses(
        (status = 200, description = "No breaker is open", body = BreakerHealthResponse),
        (status = 503, description = "At least one breaker is open", body = BreakerHealthResponse),
    )
)]
pub async fn circuit_breaker_health_handler(State(state): State<Arc<AppState>>) -> Response {
    let open_breakers = state.breakers.open_breakers();
    if open_breakers.is_empty() {
        return (
            StatusCode::OK,
            Json(BreakerHealthResponse {
                healthy: true,
                open_breakers,
            }),
        )
            .into_response();
    }

    warn!(open = ?open_breakers, "Circuit breakers open");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(BreakerHealthResponse {
            healthy: false,
            open_breakers,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legend_covers_every_state() {
        let legend = state_legend();
        for state in ["closed", "half-open", "open"] {
            assert!(legend.contains_key(state), "missing {state}");
        }
    }
}
