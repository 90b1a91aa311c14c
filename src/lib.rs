//! EcoCup Ledger Library
//!
//! Wallet balances, escrow deposits, partner commissions and settlement
//! payouts over one append-only entry log. Exposed as a library for the HTTP
//! binary and the integration tests.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod notifications;
pub mod services;
pub mod store;

// Re-export commonly used types
pub use config::{AppConfig, LedgerConfig};
pub use error::{AppError, AppResult, LedgerError, LedgerResult};

use notifications::LedgerEvents;
use services::*;
use std::sync::Arc;
use store::LedgerStore;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Every ledger service wired to one store and one configuration
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub config: Arc<LedgerConfig>,
    pub events: LedgerEvents,
    pub audit: AuditTrailService,
    pub ledger: LedgerService,
    pub escrow: EscrowService,
    pub partners: PartnerService,
    pub settlements: Arc<SettlementService>,
    pub payments: PaymentService,
    pub reconciliation: ReconciliationService,
}

impl AppState {
    /// Build the services over an already selected store
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        let config = Arc::new(config);
        let events = LedgerEvents::new(EVENT_BUS_CAPACITY, config.low_balance_threshold);
        let audit = AuditTrailService::new(store.clone());

        Self {
            ledger: LedgerService::new(store.clone(), config.clone(), events.clone(), audit.clone()),
            escrow: EscrowService::new(store.clone(), config.clone(), events.clone(), audit.clone()),
            partners: PartnerService::new(store.clone(), config.clone(), events.clone(), audit.clone()),
            settlements: Arc::new(SettlementService::new(
                store.clone(),
                config.clone(),
                events.clone(),
                audit.clone(),
            )),
            payments: PaymentService::new(store.clone(), config.clone(), events.clone(), audit.clone()),
            reconciliation: ReconciliationService::new(store.clone()),
            store,
            config,
            events,
            audit,
        }
    }

    /// Scheduler that opens settlement batches at the configured interval
    pub fn settlement_scheduler(&self) -> SettlementScheduler {
        SettlementScheduler::new(self.store.clone(), self.settlements.clone())
            .with_interval(self.config.settlement_interval())
    }
}
