//! HTTP request flows through the full router.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use resilient_ledger::api::create_router;
use resilient_ledger::app::AppState;
use resilient_ledger::domain::{Balance, Transaction, TransactionReceipt, TransactionStatus};
use resilient_ledger::test_utils::MockLedgerStore;

fn create_test_router(store: &Arc<MockLedgerStore>) -> Router {
    create_router(Arc::new(AppState::new(Arc::clone(store))))
}

fn post_json(uri: String, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_account_lifecycle_flow() {
    let store = Arc::new(MockLedgerStore::new());
    let router = create_test_router(&store);
    let owner = Uuid::new_v4();

    // 1. Open the account
    let response = router
        .clone()
        .oneshot(post_json(format!("/accounts/{owner}"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let opened: Balance = body_json(response).await;
    assert_eq!(opened.amount, Decimal::ZERO);

    // 2. Deposit
    let response = router
        .clone()
        .oneshot(post_json(
            format!("/accounts/{owner}/deposit"),
            json!({ "amount": "25.50" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: TransactionReceipt = body_json(response).await;
    assert_eq!(receipt.balance.amount, Decimal::new(2550, 2));
    assert_eq!(receipt.transaction.status, TransactionStatus::Completed);

    // 3. Withdraw
    let response = router
        .clone()
        .oneshot(post_json(
            format!("/accounts/{owner}/withdraw"),
            json!({ "amount": "5.50" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 4. Balance and history reflect both
    let response = router
        .clone()
        .oneshot(get(&format!("/accounts/{owner}/balance")))
        .await
        .unwrap();
    let balance: Balance = body_json(response).await;
    assert_eq!(balance.amount, Decimal::new(20, 0));

    let response = router
        .clone()
        .oneshot(get(&format!("/accounts/{owner}/transactions?limit=10")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let history: Vec<Transaction> = body_json(response).await;
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_transfer_between_accounts() {
    let from = Uuid::new_v4();
    let to = Uuid::new_v4();
    let store = Arc::new(MockLedgerStore::with_balance(from, Decimal::new(100, 0)));
    store.seed_balance(to, Decimal::ZERO);
    let router = create_test_router(&store);

    let response = router
        .oneshot(post_json(
            format!("/accounts/{from}/transfer"),
            json!({ "to_owner_id": to, "amount": "30" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.balance_of(from), Some(Decimal::new(70, 0)));
    assert_eq!(store.balance_of(to), Some(Decimal::new(30, 0)));
}

#[tokio::test]
async fn test_insufficient_balance_is_unprocessable() {
    let owner = Uuid::new_v4();
    let store = Arc::new(MockLedgerStore::with_balance(owner, Decimal::new(10, 0)));
    let router = create_test_router(&store);

    let response = router
        .oneshot(post_json(
            format!("/accounts/{owner}/withdraw"),
            json!({ "amount": "20" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = body_json(response).await;
    assert_eq!(body["error"]["type"], "insufficient_balance");
}

#[tokio::test]
async fn test_unknown_account_is_not_found() {
    let store = Arc::new(MockLedgerStore::new());
    let router = create_test_router(&store);

    let response = router
        .oneshot(get(&format!("/accounts/{}/balance", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = body_json(response).await;
    assert_eq!(body["error"]["type"], "account_not_found");
}

#[tokio::test]
async fn test_non_positive_amount_is_bad_request() {
    let owner = Uuid::new_v4();
    let store = Arc::new(MockLedgerStore::with_balance(owner, Decimal::ZERO));
    let router = create_test_router(&store);

    let response = router
        .oneshot(post_json(
            format!("/accounts/{owner}/deposit"),
            json!({ "amount": "0" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.transactions().is_empty());
}

#[tokio::test]
async fn test_amount_finer_than_stored_scale_is_bad_request() {
    let owner = Uuid::new_v4();
    let store = Arc::new(MockLedgerStore::with_balance(owner, Decimal::ZERO));
    let router = create_test_router(&store);

    let response = router
        .oneshot(post_json(
            format!("/accounts/{owner}/deposit"),
            json!({ "amount": "1.0000000000000000001" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.transactions().is_empty());
    assert_eq!(store.balance_of(owner), Some(Decimal::ZERO));
}

#[tokio::test]
async fn test_open_breaker_returns_service_unavailable() {
    let owner = Uuid::new_v4();
    let store = Arc::new(MockLedgerStore::with_balance(owner, Decimal::ZERO));
    store.set_fail_balance_lookups(true);
    let router = create_test_router(&store);

    for _ in 0..6 {
        let response = router
            .clone()
            .oneshot(get(&format!("/accounts/{owner}/balance")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    let response = router
        .clone()
        .oneshot(get(&format!("/accounts/{owner}/balance")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let response = router
        .clone()
        .oneshot(get("/admin/circuit-breakers/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = body_json(response).await;
    assert_eq!(body["open_breakers"][0], "transaction->user");

    let response = router
        .oneshot(get("/admin/circuit-breakers"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = body_json(response).await;
    assert_eq!(body["breakers"]["transaction->user"], "open");
    assert!(body["legend"]["half-open"].is_string());
}

#[tokio::test]
async fn test_health_endpoints() {
    let store = Arc::new(MockLedgerStore::new());
    let router = create_test_router(&store);

    let response = router.clone().oneshot(get("/health/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    let body: Value = body_json(response).await;
    assert_eq!(body["status"], "healthy");

    store.set_healthy(false);
    let response = router.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = router
        .oneshot(get("/admin/circuit-breakers/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let store = Arc::new(MockLedgerStore::new());
    let router = create_test_router(&store);

    let response = router
        .oneshot(get("/api-docs/openapi.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = body_json(response).await;
    assert!(body["paths"]["/accounts/{owner_id}/deposit"].is_object());
    assert!(body["paths"]["/admin/circuit-breakers"].is_object());
    assert!(body["paths"]["/admin/circuit-breakers/health"].is_object());
}
