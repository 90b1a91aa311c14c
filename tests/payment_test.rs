mod helpers;

use ecocup_ledger::error::LedgerError;
use ecocup_ledger::models::*;
use helpers::*;
use tokio_test::assert_ok;

fn new_payment(user_id: &str, amount: i64, kind: PaymentTransactionType, gateway_ref: &str) -> NewPayment {
    NewPayment {
        user_id: user_id.to_string(),
        amount: dec(amount),
        payment_method: PaymentMethod::Vnpay,
        transaction_type: kind,
        gateway_txn_ref: gateway_ref.to_string(),
    }
}

fn callback(status: PaymentStatus) -> GatewayCallback {
    GatewayCallback {
        status,
        external_transaction_id: Some("VNP-EXT-1".to_string()),
        amount: None,
        error_message: None,
    }
}

#[tokio::test]
async fn test_completed_topup_posts_exactly_one_credit() {
    let ledger = TestLedger::new();
    let payment = ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 200_000, PaymentTransactionType::Topup, "VNP-1"))
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    ledger.app.payments.mark_payment_processing(payment.payment_id).await.unwrap();

    let update = ledger
        .app
        .payments
        .update_payment_by_gateway_ref("VNP-1", callback(PaymentStatus::Completed))
        .await
        .unwrap();
    assert!(!update.replayed);
    assert_eq!(update.payment.status, PaymentStatus::Completed);
    assert_eq!(update.payment.external_transaction_id.as_deref(), Some("VNP-EXT-1"));
    assert!(update.payment.completed_at.is_some());
    assert_eq!(update.balance_after, Some(dec(200_000)));
    assert_eq!(update.ledger_entry_id, update.payment.ledger_entry_id);

    // the gateway retries its callback
    let replay = ledger
        .app
        .payments
        .update_payment_by_gateway_ref("VNP-1", callback(PaymentStatus::Completed))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.ledger_entry_id, update.ledger_entry_id);

    let entries = ledger.app.ledger.account_entries("alice", 10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reference_type, ReferenceType::Topup);
    assert_eq!(entries[0].reference_id, Some(payment.payment_id.to_string()));
    assert_eq!(ledger.balance("alice").await, dec(200_000));
}

#[tokio::test]
async fn test_completed_callback_on_pending_payment() {
    let ledger = TestLedger::new();
    ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 50_000, PaymentTransactionType::Topup, "MOMO-1"))
        .await
        .unwrap();

    let update = assert_ok!(
        ledger
            .app
            .payments
            .update_payment_by_gateway_ref("MOMO-1", callback(PaymentStatus::Completed))
            .await
    );
    assert_eq!(update.payment.status, PaymentStatus::Completed);
    assert_eq!(ledger.balance("alice").await, dec(50_000));
}

#[tokio::test]
async fn test_creation_is_idempotent_on_gateway_reference() {
    let ledger = TestLedger::new();
    let request = new_payment("alice", 50_000, PaymentTransactionType::Topup, "VNP-2");

    let first = ledger.app.payments.create_payment_transaction(request.clone()).await.unwrap();
    let second = ledger.app.payments.create_payment_transaction(request).await.unwrap();
    assert_eq!(first.payment_id, second.payment_id);

    let conflicting = ledger
        .app
        .payments
        .create_payment_transaction(new_payment("mallory", 50_000, PaymentTransactionType::Topup, "VNP-2"))
        .await;
    assert!(matches!(conflicting, Err(LedgerError::ExternalReferenceMismatch(_))));
}

#[tokio::test]
async fn test_unknown_reference_and_amount_mismatch() {
    let ledger = TestLedger::new();
    ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 50_000, PaymentTransactionType::Topup, "VNP-3"))
        .await
        .unwrap();

    let unknown = ledger
        .app
        .payments
        .update_payment_by_gateway_ref("VNP-404", callback(PaymentStatus::Completed))
        .await;
    assert!(matches!(unknown, Err(LedgerError::ExternalReferenceMismatch(_))));

    let tampered = ledger
        .app
        .payments
        .update_payment_by_gateway_ref(
            "VNP-3",
            GatewayCallback {
                amount: Some(dec(5_000_000)),
                ..callback(PaymentStatus::Completed)
            },
        )
        .await;
    assert!(matches!(tampered, Err(LedgerError::ExternalReferenceMismatch(_))));
    assert!(ledger.app.ledger.get_account("alice").await.is_err());
}

#[tokio::test]
async fn test_terminal_payment_cannot_move() {
    let ledger = TestLedger::new();
    let payment = ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 50_000, PaymentTransactionType::Topup, "VNP-4"))
        .await
        .unwrap();
    ledger
        .app
        .payments
        .update_payment_by_gateway_ref(
            "VNP-4",
            GatewayCallback {
                error_message: Some("card declined".to_string()),
                ..callback(PaymentStatus::Failed)
            },
        )
        .await
        .unwrap();

    let late_success = ledger
        .app
        .payments
        .update_payment_by_gateway_ref("VNP-4", callback(PaymentStatus::Completed))
        .await;
    assert!(matches!(late_success, Err(LedgerError::InvalidStateTransition { .. })));

    let stored = ledger.app.payments.get_payment(payment.payment_id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("card declined"));
    assert!(stored.ledger_entry_id.is_none());
}

#[tokio::test]
async fn test_rejected_withdrawal_marks_payment_failed() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 10_000).await;
    let payment = ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 40_000, PaymentTransactionType::Withdrawal, "BANK-1"))
        .await
        .unwrap();

    let result = ledger
        .app
        .payments
        .update_payment_by_gateway_ref("BANK-1", callback(PaymentStatus::Completed))
        .await;
    assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));

    let stored = ledger.app.payments.get_payment(payment.payment_id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert!(stored.error_message.is_some());
    assert_eq!(ledger.balance("alice").await, dec(10_000));
}

#[tokio::test]
async fn test_completed_withdrawal_debits_wallet() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 100_000).await;
    ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 40_000, PaymentTransactionType::Withdrawal, "BANK-2"))
        .await
        .unwrap();

    let update = ledger
        .app
        .payments
        .update_payment_by_gateway_ref("BANK-2", callback(PaymentStatus::Completed))
        .await
        .unwrap();
    assert_eq!(update.balance_after, Some(dec(60_000)));
    ledger.assert_no_drift().await;
}

#[tokio::test]
async fn test_cancel_payment() {
    let ledger = TestLedger::new();
    let payment = ledger
        .app
        .payments
        .create_payment_transaction(new_payment("alice", 50_000, PaymentTransactionType::Topup, "VNP-5"))
        .await
        .unwrap();

    let stranger = ledger
        .app
        .payments
        .cancel_payment(payment.payment_id, &Actor::User("bob".to_string()))
        .await;
    assert!(matches!(stranger, Err(LedgerError::Unauthorized(_))));

    let cancelled = ledger
        .app
        .payments
        .cancel_payment(payment.payment_id, &Actor::User("alice".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, PaymentStatus::Cancelled);

    let listed = ledger.app.payments.payments_for_user("alice", 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, PaymentStatus::Cancelled);
}

#[tokio::test]
async fn test_missing_payment() {
    let ledger = TestLedger::new();
    let result = ledger.app.payments.get_payment(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}
