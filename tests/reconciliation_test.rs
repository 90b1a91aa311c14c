mod helpers;

use chrono::{Duration, Utc};
use ecocup_ledger::error::LedgerError;
use ecocup_ledger::models::*;
use ecocup_ledger::services::{CommissionRequest, HoldRequest, ReleaseRequest};
use ecocup_ledger::store::LedgerKind;
use helpers::*;
use rust_decimal::Decimal;

#[tokio::test]
async fn test_report_sums_each_flow_independently() {
    let ledger = TestLedger::new();
    let start = Utc::now() - Duration::minutes(1);

    ledger.fund("alice", 100_000).await;
    ledger.fund("bob", 20_000).await;
    ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(15_000), ReferenceType::Withdrawal))
        .await
        .unwrap();
    ledger
        .app
        .ledger
        .post_entry(NewEntry::credit("bob", dec(3_000), ReferenceType::Refund))
        .await
        .unwrap();
    ledger
        .app
        .ledger
        .post_entry(
            NewEntry::credit("bob", dec(500), ReferenceType::BalanceCorrection).initiated_by(admin()),
        )
        .await
        .unwrap();

    ledger
        .app
        .escrow
        .hold_escrow(HoldRequest {
            account_id: "alice".to_string(),
            escrow_type: EscrowType::CupDeposit,
            amount: dec(50_000),
            escrow_ref: Some("cup-1".to_string()),
            initiated_by: Actor::System,
        })
        .await
        .unwrap();
    ledger
        .app
        .escrow
        .release_escrow(ReleaseRequest {
            account_id: "alice".to_string(),
            escrow_type: EscrowType::CupDeposit,
            amount: dec(50_000),
            fee: dec(10_000),
            escrow_ref: Some("cup-1".to_string()),
            initiated_by: Actor::System,
        })
        .await
        .unwrap();

    ledger.active_partner("canteen-1", Decimal::new(10, 2)).await;
    ledger
        .app
        .partners
        .credit_commission(CommissionRequest {
            partner_id: "canteen-1".to_string(),
            amount: dec(8_000),
            reference_id: Some("order-1".to_string()),
            description: None,
            initiated_by: Actor::System,
        })
        .await
        .unwrap();

    let report = ledger
        .app
        .reconciliation
        .reconciliation_report(start, Utc::now() + Duration::minutes(1))
        .await
        .unwrap();

    assert_eq!(report.topups, dec(120_000));
    assert_eq!(report.withdrawals, dec(15_000));
    assert_eq!(report.net_flow, dec(105_000));
    assert_eq!(report.refunds, dec(3_000));
    assert_eq!(report.corrections_net, dec(500));
    assert_eq!(report.escrow_holds, dec(50_000));
    assert_eq!(report.escrow_release_credits, dec(40_000));
    assert_eq!(report.escrow_fees_retained, dec(10_000));
    assert_eq!(report.commissions, dec(8_000));
    assert_eq!(report.settlement_payouts, dec(0));
    assert!(report.is_balanced());

    let topup_total = report
        .entry_totals
        .iter()
        .find(|t| t.reference_type == ReferenceType::Topup && t.entry_type == EntryType::Credit)
        .expect("topup total");
    assert_eq!(topup_total.count, 2);
}

#[tokio::test]
async fn test_period_excludes_earlier_entries() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 100_000).await;

    let later = Utc::now() + Duration::hours(1);
    let report = ledger
        .app
        .reconciliation
        .reconciliation_report(later, later + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.topups, dec(0));
    assert!(report.entry_totals.is_empty());
}

#[tokio::test]
async fn test_inverted_period_is_rejected() {
    let ledger = TestLedger::new();
    let now = Utc::now();
    let result = ledger
        .app
        .reconciliation
        .reconciliation_report(now, now - Duration::hours(1))
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

#[tokio::test]
async fn test_verify_account_reports_consistency() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 70_000).await;
    ledger
        .app
        .ledger
        .post_entry(NewEntry::debit("alice", dec(20_000), ReferenceType::PartnerPayment))
        .await
        .unwrap();

    let check = ledger.app.reconciliation.verify_account("alice").await.unwrap();
    assert_eq!(check.kind, LedgerKind::User);
    assert_eq!(check.projected_balance, dec(50_000));
    assert_eq!(check.ledger_balance, dec(50_000));
    assert!(check.is_consistent());

    let missing = ledger.app.reconciliation.verify_account("nobody").await;
    assert!(matches!(missing, Err(LedgerError::AccountNotFound(_))));
}

#[tokio::test]
async fn test_verify_partner() {
    let ledger = TestLedger::new();
    ledger.active_partner("canteen-2", Decimal::new(10, 2)).await;

    let check = ledger.app.reconciliation.verify_partner("canteen-2").await.unwrap();
    assert_eq!(check.kind, LedgerKind::Partner);
    assert_eq!(check.drift(), dec(0));
}
