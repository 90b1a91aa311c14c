use crate::error::{LedgerError, LedgerResult};
use crate::models::{Actor, SettlementBatch};
use crate::services::SettlementService;
use crate::store::LedgerStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Background task that opens settlement batches for every active partner
/// with pending settlement and no open batch.
pub struct SettlementScheduler {
    store: Arc<dyn LedgerStore>,
    settlements: Arc<SettlementService>,
    interval: Duration,
}

impl SettlementScheduler {
    pub fn new(store: Arc<dyn LedgerStore>, settlements: Arc<SettlementService>) -> Self {
        Self {
            store,
            settlements,
            interval: Duration::from_secs(86_400),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run forever, one sweep per interval
    pub async fn start(self) {
        let mut interval = time::interval(self.interval);
        info!("Settlement scheduler started, sweeping every {:?}", self.interval);

        loop {
            interval.tick().await;

            match self.run_once().await {
                Ok(created) if created.is_empty() => debug!("No partners due for settlement"),
                Ok(created) => info!("Opened {} settlement batches", created.len()),
                Err(e) => error!("Settlement sweep failed: {}", e),
            }
        }
    }

    /// One sweep. A partner that fails is logged and skipped.
    pub async fn run_once(&self) -> LedgerResult<Vec<SettlementBatch>> {
        let due = self.store.list_partners_due().await?;
        let mut created = Vec::with_capacity(due.len());

        for partner in due {
            let period_start = self
                .store
                .last_period_end(&partner.partner_id)
                .await?
                .unwrap_or(partner.created_at);
            let period_end = Utc::now();
            if period_start >= period_end {
                continue;
            }

            match self
                .settlements
                .create_settlement_batch(&partner.partner_id, period_start, period_end, &Actor::System)
                .await
            {
                Ok(batch) => created.push(batch),
                Err(LedgerError::NothingToSettle(_)) | Err(LedgerError::SettlementInProgress { .. }) => {
                    debug!("Partner {} no longer due", partner.partner_id);
                }
                Err(e) => warn!(
                    "Could not open settlement batch for {}: {}",
                    partner.partner_id, e
                ),
            }
        }

        Ok(created)
    }
}
