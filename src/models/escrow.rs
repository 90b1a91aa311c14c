//! Escrow models: deposits held against a typed purpose

use crate::models::ReferenceType;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Purpose of an escrow hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowType {
    CupDeposit,
    EbikeDeposit,
    TransportPrepay,
}

impl EscrowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CupDeposit => "cup_deposit",
            Self::EbikeDeposit => "ebike_deposit",
            Self::TransportPrepay => "transport_prepay",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cup_deposit" => Some(Self::CupDeposit),
            "ebike_deposit" => Some(Self::EbikeDeposit),
            "transport_prepay" => Some(Self::TransportPrepay),
            _ => None,
        }
    }

    /// Reference type tagging the debit that places the hold
    pub fn hold_reference(&self) -> ReferenceType {
        match self {
            Self::CupDeposit => ReferenceType::CupDepositHold,
            Self::EbikeDeposit => ReferenceType::EbikeDepositHold,
            Self::TransportPrepay => ReferenceType::TransportPrepayHold,
        }
    }

    /// Reference type tagging the credit that returns the refund
    pub fn release_reference(&self) -> ReferenceType {
        match self {
            Self::CupDeposit => ReferenceType::CupDepositRelease,
            Self::EbikeDeposit => ReferenceType::EbikeDepositRelease,
            Self::TransportPrepay => ReferenceType::TransportPrepayRelease,
        }
    }
}

/// One release of escrowed funds. `amount` is the gross amount taken out of
/// escrow; only `refund_amount = amount - fee` goes back to the wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRelease {
    pub release_id: Uuid,
    pub account_id: String,
    pub escrow_type: EscrowType,
    pub escrow_ref: Option<String>,
    pub amount: Decimal,
    pub fee: Decimal,
    pub refund_amount: Decimal,
    /// Refund credit; absent when the whole deposit was kept as a fee
    pub ledger_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Derived escrow balance for an account and purpose
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EscrowPosition {
    pub held: Decimal,
    pub released: Decimal,
}

impl EscrowPosition {
    pub fn outstanding(&self) -> Decimal {
        self.held - self.released
    }
}

/// Result of placing a hold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowHoldReceipt {
    pub ledger_id: Uuid,
    pub balance_after: Decimal,
    pub replayed: bool,
}

/// Result of releasing a hold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowReleaseReceipt {
    pub release_id: Uuid,
    pub refund_amount: Decimal,
    pub fee: Decimal,
    pub ledger_id: Option<Uuid>,
    pub balance_after: Decimal,
    pub replayed: bool,
}
