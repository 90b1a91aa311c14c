mod helpers;

use ecocup_ledger::error::LedgerError;
use ecocup_ledger::models::*;
use ecocup_ledger::services::TransferRequest;
use futures::future::join_all;
use helpers::*;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_credit_opens_account_and_moves_balance() {
    let ledger = TestLedger::new();

    let posted = assert_ok!(
        ledger
            .app
            .ledger
            .post_entry(NewEntry::credit("alice", dec(100_000), ReferenceType::Topup).with_reference("top-1"))
            .await
    );

    assert!(!posted.replayed);
    assert_eq!(posted.entry.balance_before, dec(0));
    assert_eq!(posted.balance_after(), dec(100_000));
    assert_eq!(ledger.balance("alice").await, dec(100_000));

    let account = ledger.app.ledger.get_account("alice").await.unwrap();
    assert!(!account.frozen);
    assert_eq!(account.limits(), ledger.app.config.default_withdrawal_limits());
}

#[tokio::test]
async fn test_balance_matches_entry_log() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 100_000).await;

    ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(30_000), ReferenceType::Withdrawal).with_reference("wd-1"))
        .await
        .unwrap();
    ledger
        .app
        .ledger
        .post_entry(NewEntry::credit("alice", dec(5_000), ReferenceType::Reward).with_reference("rw-1"))
        .await
        .unwrap();

    let entries = ledger.app.ledger.account_entries("alice", 50, 0).await.unwrap();
    assert_eq!(entries.len(), 3);
    let signed: rust_decimal::Decimal = entries.iter().map(|e| e.signed_amount()).sum();
    assert_eq!(signed, dec(75_000));
    assert_eq!(ledger.balance("alice").await, dec(75_000));

    // newest first
    assert_eq!(entries[0].reference_type, ReferenceType::Reward);
    for entry in &entries {
        assert_eq!(entry.balance_after, entry.balance_before + entry.signed_amount());
    }

    ledger.assert_no_drift().await;
}

#[tokio::test]
async fn test_replayed_reference_returns_original_entry() {
    let ledger = TestLedger::new();
    let request = NewEntry::credit("alice", dec(50_000), ReferenceType::Topup).with_reference("gw-42");

    let first = ledger.app.ledger.post_entry(request.clone()).await.unwrap();
    let second = ledger.app.ledger.post_entry(request).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.ledger_id(), second.ledger_id());
    assert_eq!(ledger.balance("alice").await, dec(50_000));
    assert_eq!(ledger.app.ledger.account_entries("alice", 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_insufficient_funds_leaves_no_trace() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 10_000).await;

    let result = ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(10_001), ReferenceType::PartnerPayment))
        .await;

    match result {
        Err(LedgerError::InsufficientFunds { available, requested, .. }) => {
            assert_eq!(available, dec(10_000));
            assert_eq!(requested, dec(10_001));
        }
        other => panic!("Expected InsufficientFunds, got {:?}", other),
    }
    assert_eq!(ledger.balance("alice").await, dec(10_000));
    assert_eq!(ledger.app.ledger.account_entries("alice", 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_amounts_are_rejected() {
    let ledger = TestLedger::new();

    let zero = ledger
        .app
        .ledger
        .post_entry(NewEntry::credit("alice", dec(0), ReferenceType::Topup))
        .await;
    assert!(matches!(zero, Err(LedgerError::InvalidAmount(_))));

    let fractional = ledger
        .app
        .ledger
        .post_entry(NewEntry::credit("alice", rust_decimal::Decimal::new(105, 1), ReferenceType::Topup))
        .await;
    assert!(matches!(fractional, Err(LedgerError::InvalidAmount(_))));
}

#[tokio::test]
async fn test_debit_from_unknown_account() {
    let ledger = TestLedger::new();
    let result = ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("ghost", dec(1), ReferenceType::Withdrawal))
        .await;
    assert!(matches!(result, Err(LedgerError::AccountNotFound(id)) if id == "ghost"));
}

#[tokio::test]
async fn test_two_concurrent_debits_only_one_succeeds() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 100_000).await;

    let attempts = (0..2).map(|i| {
        let service = ledger.app.ledger.clone();
        tokio::spawn(async move {
            service
                .post_entry(
                    NewEntry::debit("alice", dec(60_000), ReferenceType::PartnerPayment)
                        .with_reference(format!("order-{}", i)),
                )
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 1);
    assert_eq!(ledger.balance("alice").await, dec(40_000));
}

#[tokio::test]
async fn test_concurrent_debits_never_overdraw() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 100).await;

    let attempts = (0..10).map(|i| {
        let service = ledger.app.ledger.clone();
        tokio::spawn(async move {
            service
                .post_entry(
                    NewEntry::debit("alice", dec(30), ReferenceType::PartnerPayment)
                        .with_reference(format!("order-{}", i)),
                )
                .await
        })
    });
    let succeeded = join_all(attempts)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(_))))
        .count();

    // floor(100 / 30)
    assert_eq!(succeeded, 3);
    assert_eq!(ledger.balance("alice").await, dec(10));
    ledger.assert_no_drift().await;
}

#[tokio::test]
async fn test_frozen_wallet_rejects_debits_but_accepts_credits() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 1_000).await;

    let denied = ledger
        .app
        .ledger
        .freeze_account("alice", &Actor::Admin("intruder".to_string()))
        .await;
    assert!(matches!(denied, Err(LedgerError::Unauthorized(_))));

    let frozen = ledger.app.ledger.freeze_account("alice", &admin()).await.unwrap();
    assert!(frozen.frozen);

    let debit = ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(10), ReferenceType::Withdrawal))
        .await;
    assert!(matches!(debit, Err(LedgerError::WalletFrozen(_))));
    assert_eq!(ledger.fund("alice", 500).await, dec(1_500));

    ledger.app.ledger.unfreeze_account("alice", &admin()).await.unwrap();
    assert_ok!(
        ledger
            .app
            .ledger
            .post_entry(NewEntry::debit("alice", dec(10), ReferenceType::Withdrawal))
            .await
    );
}

#[tokio::test]
async fn test_balance_correction_requires_admin() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 1_000).await;

    let by_user = ledger
        .app
        .ledger
        .post_entry(
            NewEntry::credit("alice", dec(200), ReferenceType::BalanceCorrection)
                .initiated_by(Actor::User("alice".to_string())),
        )
        .await;
    assert!(matches!(by_user, Err(LedgerError::Unauthorized(_))));

    let by_admin = ledger
        .app
        .ledger
        .post_entry(
            NewEntry::debit("alice", dec(200), ReferenceType::BalanceCorrection)
                .with_reference("ticket-17")
                .initiated_by(admin()),
        )
        .await
        .unwrap();
    assert_eq!(by_admin.balance_after(), dec(800));
}

#[tokio::test]
async fn test_withdrawal_limits_apply_per_day() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 10_000).await;
    ledger
        .app
        .ledger
        .set_withdrawal_limits(
            "alice",
            WithdrawalLimits {
                daily: dec(1_000),
                monthly: dec(5_000),
            },
            &admin(),
        )
        .await
        .unwrap();

    assert_ok!(
        ledger
            .app
            .ledger
            .post_entry(NewEntry::debit("alice", dec(800), ReferenceType::Withdrawal))
            .await
    );
    let over = ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(300), ReferenceType::Withdrawal))
        .await;
    match over {
        Err(LedgerError::WithdrawalLimitExceeded { period, used, .. }) => {
            assert_eq!(period, "daily");
            assert_eq!(used, dec(800));
        }
        other => panic!("Expected WithdrawalLimitExceeded, got {:?}", other),
    }

    // other debits are not withdrawals
    assert_ok!(
        ledger
            .app
            .ledger
            .post_entry(NewEntry::debit("alice", dec(300), ReferenceType::PartnerPayment))
            .await
    );
}

#[tokio::test]
async fn test_transfer_moves_funds_atomically() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 1_000).await;

    let request = TransferRequest {
        from_account: "alice".to_string(),
        to_account: "bob".to_string(),
        amount: dec(400),
        reference_id: Some("gift-1".to_string()),
        description: Some("lunch".to_string()),
        initiated_by: Actor::User("alice".to_string()),
    };
    let receipt = ledger.app.ledger.transfer(request.clone()).await.unwrap();
    assert!(!receipt.replayed);
    assert_eq!(receipt.debit.reference_type, ReferenceType::TransferOut);
    assert_eq!(receipt.credit.reference_type, ReferenceType::TransferIn);
    assert_eq!(ledger.balance("alice").await, dec(600));
    assert_eq!(ledger.balance("bob").await, dec(400));

    let replay = ledger.app.ledger.transfer(request).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.debit.ledger_id, receipt.debit.ledger_id);
    assert_eq!(ledger.balance("alice").await, dec(600));

    let too_much = ledger
        .app
        .ledger
        .transfer(TransferRequest {
            from_account: "alice".to_string(),
            to_account: "bob".to_string(),
            amount: dec(601),
            reference_id: None,
            description: None,
            initiated_by: Actor::System,
        })
        .await;
    assert!(matches!(too_much, Err(LedgerError::InsufficientFunds { .. })));
    assert_eq!(ledger.balance("bob").await, dec(400));

    ledger.assert_no_drift().await;
}

#[tokio::test]
async fn test_transfer_to_self_is_rejected() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 1_000).await;

    let result = ledger
        .app
        .ledger
        .transfer(TransferRequest {
            from_account: "alice".to_string(),
            to_account: "alice".to_string(),
            amount: dec(1),
            reference_id: None,
            description: None,
            initiated_by: Actor::System,
        })
        .await;
    assert_err!(result);
}

#[tokio::test]
async fn test_low_balance_event_after_debit() {
    let ledger = TestLedger::new();
    let mut events = ledger.app.events.subscribe();
    ledger.fund("alice", 25_000).await;

    ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(10_000), ReferenceType::PartnerPayment))
        .await
        .unwrap();

    let mut saw_low_balance = false;
    while let Ok(event) = events.try_recv() {
        if let ecocup_ledger::notifications::LedgerEvent::LowBalance { balance, .. } = event {
            assert_eq!(balance, dec(15_000));
            saw_low_balance = true;
        }
    }
    assert!(saw_low_balance);
}

#[tokio::test]
async fn test_operations_are_audited() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 1_000).await;
    ledger.app.ledger.freeze_account("alice", &admin()).await.unwrap();

    let records = ledger
        .app
        .audit
        .list(Some("wallet_account"), Some("alice"), 10)
        .await
        .unwrap();
    let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
    assert!(actions.contains(&"entry_posted"));
    assert!(actions.contains(&"wallet_frozen"));
}
