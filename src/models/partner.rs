//! Partner merchant wallet

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of partner merchant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerType {
    Store,
    Canteen,
    EbikeStation,
    TransportOperator,
}

impl PartnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Canteen => "canteen",
            Self::EbikeStation => "ebike_station",
            Self::TransportOperator => "transport_operator",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "store" => Some(Self::Store),
            "canteen" => Some(Self::Canteen),
            "ebike_station" => Some(Self::EbikeStation),
            "transport_operator" => Some(Self::TransportOperator),
            _ => None,
        }
    }
}

/// Partner lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerStatus {
    Active,
    Suspended,
    PendingVerification,
}

impl PartnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::PendingVerification => "pending_verification",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "pending_verification" => Some(Self::PendingVerification),
            _ => None,
        }
    }
}

/// Partner wallet. `balance` is the signed sum of partner ledger entries;
/// `pending_settlement` is the commission accrued since the last payout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerWallet {
    pub partner_id: String,
    pub partner_type: PartnerType,
    pub balance: Decimal,
    pub pending_settlement: Decimal,
    pub total_earned: Decimal,
    /// Platform share withheld at settlement, e.g. 0.10 for 10%
    pub commission_rate: Decimal,
    pub status: PartnerStatus,
    pub bank_account: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartnerWallet {
    pub fn new(
        partner_id: impl Into<String>,
        partner_type: PartnerType,
        commission_rate: Decimal,
        bank_account: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            partner_id: partner_id.into(),
            partner_type,
            balance: Decimal::ZERO,
            pending_settlement: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            commission_rate,
            status: PartnerStatus::PendingVerification,
            bank_account,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PartnerStatus::Active
    }
}

/// Onboarding request for a partner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPartner {
    pub partner_id: String,
    pub partner_type: PartnerType,
    pub commission_rate: Decimal,
    #[serde(default)]
    pub bank_account: Option<String>,
}

impl NewPartner {
    pub fn validate(&self) -> Result<(), String> {
        if self.partner_id.trim().is_empty() {
            return Err("partner_id must not be empty".to_string());
        }
        if self.commission_rate < Decimal::ZERO || self.commission_rate > Decimal::ONE {
            return Err("commission_rate must be between 0 and 1".to_string());
        }
        Ok(())
    }
}
