//! Fixed-point amount rules shared by every ledger operation.

use crate::error::{LedgerError, LedgerResult};
use rust_decimal::{Decimal, RoundingStrategy};

/// Validate an amount moved by a ledger entry: strictly positive and no finer
/// than the currency scale.
pub fn validate_amount(amount: Decimal, scale: u32) -> LedgerResult<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be greater than zero, got {}",
            amount
        )));
    }
    if amount.normalize().scale() > scale {
        return Err(LedgerError::InvalidAmount(format!(
            "amount {} has more than {} fractional digits",
            amount, scale
        )));
    }
    Ok(())
}

/// Validate a fee or limit: zero is allowed, negatives are not.
pub fn validate_non_negative(amount: Decimal, scale: u32, field: &str) -> LedgerResult<()> {
    if amount < Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!("{} must not be negative", field)));
    }
    if amount.normalize().scale() > scale {
        return Err(LedgerError::InvalidAmount(format!(
            "{} {} has more than {} fractional digits",
            field, amount, scale
        )));
    }
    Ok(())
}

/// Round to the currency scale, half away from zero
pub fn round_to_scale(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}
