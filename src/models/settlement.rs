//! Settlement batch model and its state machine

use crate::models::money::round_to_scale;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Approved,
    Processing,
    Paid,
    Cancelled,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Processing => "processing",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "processing" => Some(Self::Processing),
            "paid" => Some(Self::Paid),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Allowed edges. No state is ever revisited.
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Approved, Processing)
                | (Processing, Paid)
                | (Pending, Cancelled)
                | (Approved, Cancelled)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled | Self::Failed)
    }

    /// Statuses that still hold a snapshot of the partner's pending balance
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

/// Snapshot of a partner's pending commission moving through approval and payout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub batch_id: Uuid,
    pub partner_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_transactions: i64,
    pub gross_amount: Decimal,
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub net_amount: Decimal,
    pub status: SettlementStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementBatch {
    /// Copy of this batch moved to `next`, stamped with the update time
    pub fn with_status(&self, next: SettlementStatus) -> Self {
        let mut batch = self.clone();
        batch.status = next;
        batch.updated_at = Utc::now();
        batch
    }
}

/// Split a gross amount into the platform commission and the partner's net
/// payout. The commission is rounded to the currency scale and the net is the
/// remainder, so `gross == commission + net` holds exactly.
pub fn split_commission(gross: Decimal, rate: Decimal, scale: u32) -> (Decimal, Decimal) {
    let commission = round_to_scale(gross * rate, scale);
    (commission, gross - commission)
}

/// Filter for listing settlement batches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementFilter {
    pub partner_id: Option<String>,
    pub status: Option<SettlementStatus>,
}
