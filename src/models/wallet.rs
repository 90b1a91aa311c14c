//! User wallet projection over the ledger

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Materialized balance of one account. Kept equal to the signed sum of its
/// ledger entries by the atomic entry operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub account_id: String,
    pub balance: Decimal,
    pub frozen: bool,
    pub daily_withdrawal_limit: Decimal,
    pub monthly_withdrawal_limit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAccount {
    /// Create an empty account with the given limits
    pub fn new(account_id: impl Into<String>, limits: WithdrawalLimits) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            balance: Decimal::ZERO,
            frozen: false,
            daily_withdrawal_limit: limits.daily,
            monthly_withdrawal_limit: limits.monthly,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn limits(&self) -> WithdrawalLimits {
        WithdrawalLimits {
            daily: self.daily_withdrawal_limit,
            monthly: self.monthly_withdrawal_limit,
        }
    }
}

/// Per-period withdrawal caps
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalLimits {
    pub daily: Decimal,
    pub monthly: Decimal,
}

impl WithdrawalLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.daily < Decimal::ZERO || self.monthly < Decimal::ZERO {
            return Err("Withdrawal limits must not be negative".to_string());
        }
        if self.daily > self.monthly {
            return Err("Daily withdrawal limit must not exceed the monthly limit".to_string());
        }
        Ok(())
    }
}
