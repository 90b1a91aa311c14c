//! Payment gateway transactions and their state machine

use crate::models::{EntryType, ReferenceType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Pending, Failed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Gateway used for the payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Vnpay,
    Momo,
    BankTransfer,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vnpay => "vnpay",
            Self::Momo => "momo",
            Self::BankTransfer => "bank_transfer",
            Self::Card => "card",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "vnpay" => Some(Self::Vnpay),
            "momo" => Some(Self::Momo),
            "bank_transfer" => Some(Self::BankTransfer),
            "card" => Some(Self::Card),
            _ => None,
        }
    }
}

/// Direction of money through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentTransactionType {
    Topup,
    Refund,
    Withdrawal,
}

impl PaymentTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "topup",
            Self::Refund => "refund",
            Self::Withdrawal => "withdrawal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "topup" => Some(Self::Topup),
            "refund" => Some(Self::Refund),
            "withdrawal" => Some(Self::Withdrawal),
            _ => None,
        }
    }

    /// Ledger entry posted when a payment of this type completes
    pub fn ledger_posting(&self) -> (EntryType, ReferenceType) {
        match self {
            Self::Topup => (EntryType::Credit, ReferenceType::Topup),
            Self::Refund => (EntryType::Credit, ReferenceType::Refund),
            Self::Withdrawal => (EntryType::Debit, ReferenceType::Withdrawal),
        }
    }
}

/// Payment tracked from creation to the gateway's final callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub payment_id: Uuid,
    pub user_id: String,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub transaction_type: PaymentTransactionType,
    pub status: PaymentStatus,
    pub external_transaction_id: Option<String>,
    /// Gateway reference; the idempotency key for callbacks
    pub gateway_txn_ref: String,
    pub error_message: Option<String>,
    pub ledger_entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to open a payment before redirecting to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: String,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub transaction_type: PaymentTransactionType,
    pub gateway_txn_ref: String,
}

impl NewPayment {
    pub fn into_transaction(self) -> PaymentTransaction {
        let now = Utc::now();
        PaymentTransaction {
            payment_id: Uuid::new_v4(),
            user_id: self.user_id,
            amount: self.amount,
            payment_method: self.payment_method,
            transaction_type: self.transaction_type,
            status: PaymentStatus::Pending,
            external_transaction_id: None,
            gateway_txn_ref: self.gateway_txn_ref,
            error_message: None,
            ledger_entry_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Gateway callback, already signature-checked by the webhook handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub status: PaymentStatus,
    #[serde(default)]
    pub external_transaction_id: Option<String>,
    /// Amount reported by the gateway, checked against the tracked payment
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Outcome of applying a gateway callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub payment: PaymentTransaction,
    /// Ledger entry posted by this callback (only on the move into completed)
    pub ledger_entry_id: Option<Uuid>,
    pub balance_after: Option<Decimal>,
    /// True when the callback repeated an already applied terminal status
    pub replayed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use PaymentStatus::*;

    #[test]
    fn test_payment_transitions() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_withdrawal_posts_debit() {
        let (entry_type, reference_type) = PaymentTransactionType::Withdrawal.ledger_posting();
        assert_eq!(entry_type, EntryType::Debit);
        assert_eq!(reference_type, ReferenceType::Withdrawal);
    }
}
