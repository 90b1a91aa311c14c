use crate::error::LedgerResult;
use crate::models::{Actor, AuditRecord};
use crate::store::LedgerStore;
use std::sync::Arc;
use tracing::warn;

/// Audit trail for state-changing ledger operations.
///
/// Records are written in their own store transaction after the operation
/// has committed. A failed write is logged and never fails the operation.
#[derive(Clone)]
pub struct AuditTrailService {
    store: Arc<dyn LedgerStore>,
}

impl AuditTrailService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Best-effort write of one audit record
    pub async fn log(&self, record: AuditRecord) {
        let action = record.action.clone();
        let subject = format!("{}:{}", record.subject_type, record.subject_id);
        if let Err(e) = self.try_log(&record).await {
            warn!("Failed to write audit record {} for {}: {}", action, subject, e);
        }
    }

    async fn try_log(&self, record: &AuditRecord) -> LedgerResult<()> {
        let mut tx = self.store.begin().await?;
        tx.insert_audit(record).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record(
        &self,
        action: &str,
        actor: &Actor,
        subject_type: &str,
        subject_id: impl Into<String>,
        details: serde_json::Value,
    ) {
        self.log(AuditRecord::new(action, actor, subject_type, subject_id, details))
            .await
    }

    /// Newest first
    pub async fn list(
        &self,
        subject_type: Option<&str>,
        subject_id: Option<&str>,
        limit: i64,
    ) -> LedgerResult<Vec<AuditRecord>> {
        Ok(self.store.list_audit(subject_type, subject_id, limit).await?)
    }
}
