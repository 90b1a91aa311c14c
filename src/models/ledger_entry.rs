//! Ledger entry models: the append-only record behind every balance

use crate::models::Actor;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            _ => None,
        }
    }

    /// Apply the sign of this entry type to an amount
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit => amount,
            Self::Debit => -amount,
        }
    }
}

/// What caused a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Topup,
    Withdrawal,
    Refund,
    CupDepositHold,
    CupDepositRelease,
    EbikeDepositHold,
    EbikeDepositRelease,
    TransportPrepayHold,
    TransportPrepayRelease,
    Commission,
    SettlementPayout,
    BalanceCorrection,
    TransferOut,
    TransferIn,
    PartnerPayment,
    Reward,
}

impl ReferenceType {
    pub const ALL: [ReferenceType; 16] = [
        Self::Topup,
        Self::Withdrawal,
        Self::Refund,
        Self::CupDepositHold,
        Self::CupDepositRelease,
        Self::EbikeDepositHold,
        Self::EbikeDepositRelease,
        Self::TransportPrepayHold,
        Self::TransportPrepayRelease,
        Self::Commission,
        Self::SettlementPayout,
        Self::BalanceCorrection,
        Self::TransferOut,
        Self::TransferIn,
        Self::PartnerPayment,
        Self::Reward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "topup",
            Self::Withdrawal => "withdrawal",
            Self::Refund => "refund",
            Self::CupDepositHold => "cup_deposit_hold",
            Self::CupDepositRelease => "cup_deposit_release",
            Self::EbikeDepositHold => "ebike_deposit_hold",
            Self::EbikeDepositRelease => "ebike_deposit_release",
            Self::TransportPrepayHold => "transport_prepay_hold",
            Self::TransportPrepayRelease => "transport_prepay_release",
            Self::Commission => "commission",
            Self::SettlementPayout => "settlement_payout",
            Self::BalanceCorrection => "balance_correction",
            Self::TransferOut => "transfer_out",
            Self::TransferIn => "transfer_in",
            Self::PartnerPayment => "partner_payment",
            Self::Reward => "reward",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == s)
    }

    pub fn is_escrow_hold(&self) -> bool {
        matches!(
            self,
            Self::CupDepositHold | Self::EbikeDepositHold | Self::TransportPrepayHold
        )
    }

    pub fn is_escrow_release(&self) -> bool {
        matches!(
            self,
            Self::CupDepositRelease | Self::EbikeDepositRelease | Self::TransportPrepayRelease
        )
    }
}

/// Immutable ledger entry. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ledger_id: Uuid,
    pub account_id: String,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect of this entry on the account balance
    pub fn signed_amount(&self) -> Decimal {
        self.entry_type.signed(self.amount)
    }
}

/// Request to append one entry to an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntry {
    pub account_id: String,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub reference_type: ReferenceType,
    /// Idempotency key, unique per (account, reference type)
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub initiated_by: Actor,
}

impl NewEntry {
    pub fn credit(account_id: impl Into<String>, amount: Decimal, reference_type: ReferenceType) -> Self {
        Self::new(account_id, EntryType::Credit, amount, reference_type)
    }

    pub fn debit(account_id: impl Into<String>, amount: Decimal, reference_type: ReferenceType) -> Self {
        Self::new(account_id, EntryType::Debit, amount, reference_type)
    }

    fn new(
        account_id: impl Into<String>,
        entry_type: EntryType,
        amount: Decimal,
        reference_type: ReferenceType,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            entry_type,
            amount,
            reference_type,
            reference_id: None,
            description: None,
            metadata: None,
            initiated_by: Actor::System,
        }
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn initiated_by(mut self, actor: Actor) -> Self {
        self.initiated_by = actor;
        self
    }

    /// Build the entry that this request appends on top of `balance_before`
    pub fn to_entry(&self, balance_before: Decimal, now: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            ledger_id: Uuid::new_v4(),
            account_id: self.account_id.clone(),
            entry_type: self.entry_type,
            amount: self.amount,
            balance_before,
            balance_after: balance_before + self.entry_type.signed(self.amount),
            reference_type: self.reference_type,
            reference_id: self.reference_id.clone(),
            description: self.description.clone(),
            metadata: self
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
        }
    }
}

/// Result of the atomic entry operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedEntry {
    pub entry: LedgerEntry,
    /// True when an earlier entry with the same idempotency key was returned
    pub replayed: bool,
}

impl PostedEntry {
    pub fn fresh(entry: LedgerEntry) -> Self {
        Self { entry, replayed: false }
    }

    pub fn replayed(entry: LedgerEntry) -> Self {
        Self { entry, replayed: true }
    }

    pub fn ledger_id(&self) -> Uuid {
        self.entry.ledger_id
    }

    pub fn balance_after(&self) -> Decimal {
        self.entry.balance_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_type_round_trips_through_str() {
        for reference_type in ReferenceType::ALL {
            assert_eq!(ReferenceType::from_str(reference_type.as_str()), Some(reference_type));
        }
        assert_eq!(ReferenceType::from_str("bet_placed"), None);
    }

    #[test]
    fn test_to_entry_applies_sign() {
        let request = NewEntry::debit("u1", Decimal::new(30, 0), ReferenceType::Withdrawal);
        let entry = request.to_entry(Decimal::new(100, 0), Utc::now());
        assert_eq!(entry.balance_after, Decimal::new(70, 0));
        assert_eq!(entry.signed_amount(), Decimal::new(-30, 0));
        assert_eq!(entry.metadata, serde_json::json!({}));
    }

    #[test]
    fn test_escrow_reference_classification() {
        assert!(ReferenceType::CupDepositHold.is_escrow_hold());
        assert!(ReferenceType::EbikeDepositRelease.is_escrow_release());
        assert!(!ReferenceType::Topup.is_escrow_hold());
    }
}
