use crate::models::Actor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit log row written after a state-changing ledger operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: Uuid,
    /// e.g. "entry_posted", "settlement_approved", "wallet_frozen"
    pub action: String,
    pub actor: String,
    pub subject_type: String,
    pub subject_id: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        actor: &Actor,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            action: action.into(),
            actor: actor.to_string(),
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            details,
            created_at: Utc::now(),
        }
    }
}
