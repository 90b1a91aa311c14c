#![allow(dead_code)]

use ecocup_ledger::config::LedgerConfig;
use ecocup_ledger::models::*;
use ecocup_ledger::store::{LedgerStore, MemoryLedgerStore};
use ecocup_ledger::AppState;
use rust_decimal::Decimal;
use std::sync::Arc;

pub const ADMIN_ID: &str = "ops-admin";

pub fn admin() -> Actor {
    Actor::Admin(ADMIN_ID.to_string())
}

pub fn dec(units: i64) -> Decimal {
    Decimal::new(units, 0)
}

/// Whole-unit currency with one allowlisted admin
pub fn test_config() -> LedgerConfig {
    LedgerConfig {
        admin_ids: vec![ADMIN_ID.to_string()],
        ..LedgerConfig::default()
    }
}

/// Services over a fresh in-memory store
pub struct TestLedger {
    pub store: Arc<dyn LedgerStore>,
    pub app: AppState,
}

impl TestLedger {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        Self::over(store, config)
    }

    pub fn over(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        let app = AppState::new(store.clone(), config);
        Self { store, app }
    }

    /// Top up `account_id` by `amount`, returning the new balance
    pub async fn fund(&self, account_id: &str, amount: i64) -> Decimal {
        self.app
            .ledger
            .post_entry(
                NewEntry::credit(account_id, dec(amount), ReferenceType::Topup)
                    .with_reference(uuid::Uuid::new_v4().to_string()),
            )
            .await
            .expect("Failed to fund account")
            .balance_after()
    }

    pub async fn balance(&self, account_id: &str) -> Decimal {
        self.app
            .ledger
            .balance(account_id)
            .await
            .expect("Failed to read balance")
    }

    /// Register a partner and verify it
    pub async fn active_partner(&self, partner_id: &str, commission_rate: Decimal) -> PartnerWallet {
        self.app
            .partners
            .register_partner(
                NewPartner {
                    partner_id: partner_id.to_string(),
                    partner_type: PartnerType::Canteen,
                    commission_rate,
                    bank_account: Some("VCB-0001".to_string()),
                },
                &Actor::System,
            )
            .await
            .expect("Failed to register partner");
        self.app
            .partners
            .set_partner_status(partner_id, PartnerStatus::Active, &admin())
            .await
            .expect("Failed to activate partner")
    }

    /// Every account must match its entry log
    pub async fn assert_no_drift(&self) {
        let now = chrono::Utc::now();
        let report = self
            .app
            .reconciliation
            .reconciliation_report(now - chrono::Duration::days(1), now + chrono::Duration::days(1))
            .await
            .expect("Failed to build reconciliation report");
        assert!(
            report.is_balanced(),
            "drift found: users {:?}, partners {:?}",
            report.user_drift,
            report.partner_drift
        );
    }
}
