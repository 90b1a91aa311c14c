mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ecocup_ledger::api::build_router;
use ecocup_ledger::models::*;
use helpers::*;
use serde_json::{json, Value};
use tower::ServiceExt;

fn router() -> (TestLedger, Router) {
    let ledger = TestLedger::new();
    let app = build_router(ledger.app.clone());
    (ledger, app)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("Failed to build request");

    let response = app.clone().oneshot(request).await.expect("Router failed");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    (status, bytes.to_vec())
}

fn error_code(body: &[u8]) -> String {
    let value: Value = serde_json::from_slice(body).expect("error body is json");
    value["code"].as_str().unwrap_or_default().to_string()
}

fn topup(account_id: &str, amount: &str, reference: &str) -> Value {
    json!({
        "account_id": account_id,
        "entry_type": "credit",
        "amount": amount,
        "reference_type": "topup",
        "reference_id": reference,
    })
}

#[tokio::test]
async fn test_health() {
    let (_, app) = router();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "healthy");
}

#[tokio::test]
async fn test_post_entry_then_read_wallet() {
    let (_, app) = router();
    let (status, body) = send(&app, "POST", "/entries", Some(topup("alice", "100000", "VNP-1"))).await;
    assert_eq!(status, StatusCode::OK);
    let posted: PostedEntry = serde_json::from_slice(&body).unwrap();
    assert!(!posted.replayed);
    assert_eq!(posted.balance_after(), dec(100_000));

    let (status, body) = send(&app, "GET", "/wallets/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    let account: WalletAccount = serde_json::from_slice(&body).unwrap();
    assert_eq!(account.balance, dec(100_000));
    assert!(!account.frozen);

    let (status, body) = send(&app, "GET", "/wallets/alice/entries?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries: Vec<LedgerEntry> = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_business_errors_map_to_statuses() {
    let (ledger, app) = router();
    ledger.fund("alice", 10_000).await;

    let debit = json!({
        "account_id": "alice",
        "entry_type": "debit",
        "amount": "50000",
        "reference_type": "partner_payment",
    });
    let (status, body) = send(&app, "POST", "/entries", Some(debit)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "insufficient_funds");

    let (status, body) = send(&app, "GET", "/wallets/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "account_not_found");

    let zero = topup("alice", "0", "VNP-0");
    let (status, body) = send(&app, "POST", "/entries", Some(zero)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "invalid_amount");
}

#[tokio::test]
async fn test_freeze_requires_admin_and_blocks_debits() {
    let (ledger, app) = router();
    ledger.fund("alice", 10_000).await;

    let stranger = json!({ "actor": { "kind": "user", "id": "alice" } });
    let (status, body) = send(&app, "POST", "/wallets/alice/freeze", Some(stranger)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "unauthorized");

    let admin = json!({ "actor": { "kind": "admin", "id": ADMIN_ID } });
    let (status, _) = send(&app, "POST", "/wallets/alice/freeze", Some(admin)).await;
    assert_eq!(status, StatusCode::OK);

    let debit = json!({
        "account_id": "alice",
        "entry_type": "debit",
        "amount": "1000",
        "reference_type": "withdrawal",
    });
    let (status, body) = send(&app, "POST", "/entries", Some(debit)).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(error_code(&body), "wallet_frozen");
}

#[tokio::test]
async fn test_payment_lifecycle_over_http() {
    let (ledger, app) = router();

    let payment = json!({
        "user_id": "alice",
        "amount": "75000",
        "payment_method": "vnpay",
        "transaction_type": "topup",
        "gateway_txn_ref": "VNP-HTTP-1",
    });
    let (status, body) = send(&app, "POST", "/payments", Some(payment)).await;
    assert_eq!(status, StatusCode::CREATED);
    let created: PaymentTransaction = serde_json::from_slice(&body).unwrap();
    assert_eq!(created.status, PaymentStatus::Pending);

    let unknown = json!({ "status": "completed" });
    let (status, body) = send(&app, "POST", "/payments/callbacks/VNP-404", Some(unknown)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "external_reference_mismatch");

    let completed = json!({ "status": "completed", "external_transaction_id": "EXT-9" });
    let (status, _) = send(&app, "POST", "/payments/callbacks/VNP-HTTP-1", Some(completed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ledger.balance("alice").await, dec(75_000));

    let uri = format!("/payments/{}", created.payment_id);
    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let stored: PaymentTransaction = serde_json::from_slice(&body).unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn test_reconciliation_endpoint_validates_period() {
    let (_, app) = router();
    let uri = "/reconciliation?period_start=2024-06-02T00:00:00Z&period_end=2024-06-01T00:00:00Z";
    let (status, body) = send(&app, "GET", uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "validation_error");
}
