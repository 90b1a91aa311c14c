mod helpers;

use ecocup_ledger::error::LedgerError;
use ecocup_ledger::models::*;
use ecocup_ledger::services::{CommissionRequest, PartnerChargeRequest};
use helpers::*;
use rust_decimal::Decimal;

fn commission(partner_id: &str, amount: i64, reference: Option<&str>) -> CommissionRequest {
    CommissionRequest {
        partner_id: partner_id.to_string(),
        amount: dec(amount),
        reference_id: reference.map(str::to_string),
        description: None,
        initiated_by: Actor::System,
    }
}

#[tokio::test]
async fn test_registered_partner_starts_unverified() {
    let ledger = TestLedger::new();
    let partner = ledger
        .app
        .partners
        .register_partner(
            NewPartner {
                partner_id: "kiosk-1".to_string(),
                partner_type: PartnerType::Store,
                commission_rate: Decimal::new(15, 2),
                bank_account: None,
            },
            &Actor::System,
        )
        .await
        .unwrap();
    assert_eq!(partner.status, PartnerStatus::PendingVerification);
    assert_eq!(partner.balance, dec(0));

    let credit = ledger
        .app
        .partners
        .credit_commission(commission("kiosk-1", 1_000, Some("order-1")))
        .await;
    assert!(matches!(credit, Err(LedgerError::Validation(_))));

    let duplicate = ledger
        .app
        .partners
        .register_partner(
            NewPartner {
                partner_id: "kiosk-1".to_string(),
                partner_type: PartnerType::Store,
                commission_rate: Decimal::new(15, 2),
                bank_account: None,
            },
            &Actor::System,
        )
        .await;
    assert!(matches!(duplicate, Err(LedgerError::Validation(_))));
}

#[tokio::test]
async fn test_commission_raises_balance_pending_and_earnings() {
    let ledger = TestLedger::new();
    ledger.active_partner("kiosk-2", Decimal::new(10, 2)).await;

    let posted = ledger
        .app
        .partners
        .credit_commission(commission("kiosk-2", 7_000, Some("order-7")))
        .await
        .unwrap();
    assert_eq!(posted.entry.reference_type, ReferenceType::Commission);

    let replay = ledger
        .app
        .partners
        .credit_commission(commission("kiosk-2", 7_000, Some("order-7")))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.ledger_id(), posted.ledger_id());

    let partner = ledger.app.partners.get_partner("kiosk-2").await.unwrap();
    assert_eq!(partner.balance, dec(7_000));
    assert_eq!(partner.pending_settlement, dec(7_000));
    assert_eq!(partner.total_earned, dec(7_000));
}

#[tokio::test]
async fn test_suspended_partner_refuses_commission() {
    let ledger = TestLedger::new();
    ledger.active_partner("kiosk-3", Decimal::new(10, 2)).await;
    ledger
        .app
        .partners
        .set_partner_status("kiosk-3", PartnerStatus::Suspended, &admin())
        .await
        .unwrap();

    let result = ledger
        .app
        .partners
        .credit_commission(commission("kiosk-3", 1_000, None))
        .await;
    assert!(matches!(result, Err(LedgerError::WalletFrozen(_))));
}

#[tokio::test]
async fn test_charge_moves_money_across_ledgers_atomically() {
    let ledger = TestLedger::new();
    ledger.active_partner("canteen-1", Decimal::new(10, 2)).await;
    ledger.fund("alice", 50_000).await;

    let request = PartnerChargeRequest {
        user_id: "alice".to_string(),
        partner_id: "canteen-1".to_string(),
        amount: dec(35_000),
        reference_id: Some("meal-1".to_string()),
        description: Some("lunch set".to_string()),
        initiated_by: Actor::User("alice".to_string()),
    };
    let receipt = ledger.app.partners.charge_for_partner(request.clone()).await.unwrap();
    assert!(!receipt.replayed);
    assert_eq!(receipt.user_entry.reference_type, ReferenceType::PartnerPayment);
    assert_eq!(receipt.partner_entry.reference_type, ReferenceType::Commission);
    assert_eq!(ledger.balance("alice").await, dec(15_000));

    let replay = ledger.app.partners.charge_for_partner(request).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(ledger.balance("alice").await, dec(15_000));

    // the user cannot cover a second meal, and the partner is not credited
    let short = ledger
        .app
        .partners
        .charge_for_partner(PartnerChargeRequest {
            user_id: "alice".to_string(),
            partner_id: "canteen-1".to_string(),
            amount: dec(35_000),
            reference_id: Some("meal-2".to_string()),
            description: None,
            initiated_by: Actor::User("alice".to_string()),
        })
        .await;
    assert!(matches!(short, Err(LedgerError::InsufficientFunds { .. })));

    let partner = ledger.app.partners.get_partner("canteen-1").await.unwrap();
    assert_eq!(partner.balance, dec(35_000));
    assert_eq!(partner.pending_settlement, dec(35_000));
    ledger.assert_no_drift().await;
}

#[tokio::test]
async fn test_charge_to_unverified_partner_rolls_back_user_debit() {
    let ledger = TestLedger::new();
    ledger.fund("alice", 50_000).await;
    ledger
        .app
        .partners
        .register_partner(
            NewPartner {
                partner_id: "canteen-2".to_string(),
                partner_type: PartnerType::Canteen,
                commission_rate: Decimal::new(10, 2),
                bank_account: None,
            },
            &Actor::System,
        )
        .await
        .unwrap();

    let result = ledger
        .app
        .partners
        .charge_for_partner(PartnerChargeRequest {
            user_id: "alice".to_string(),
            partner_id: "canteen-2".to_string(),
            amount: dec(10_000),
            reference_id: None,
            description: None,
            initiated_by: Actor::System,
        })
        .await;
    assert!(result.is_err());
    assert_eq!(ledger.balance("alice").await, dec(50_000));
}

#[tokio::test]
async fn test_partner_status_change_requires_admin() {
    let ledger = TestLedger::new();
    ledger.active_partner("kiosk-4", Decimal::new(10, 2)).await;

    let result = ledger
        .app
        .partners
        .set_partner_status("kiosk-4", PartnerStatus::Suspended, &Actor::User("kiosk-4".to_string()))
        .await;
    assert!(matches!(result, Err(LedgerError::Unauthorized(_))));

    let updated = ledger
        .app
        .partners
        .update_bank_account("kiosk-4", Some("ACB-77".to_string()), &Actor::User("kiosk-4".to_string()))
        .await
        .unwrap();
    assert_eq!(updated.bank_account.as_deref(), Some("ACB-77"));
    assert_eq!(updated.status, PartnerStatus::Active);
}

#[tokio::test]
async fn test_unknown_partner() {
    let ledger = TestLedger::new();
    let result = ledger.app.partners.get_partner("nobody").await;
    assert!(matches!(result, Err(LedgerError::AccountNotFound(_))));
}
