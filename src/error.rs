use crate::database::DatabaseError;
use rust_decimal::Decimal;
use sqlx::Error as SqlxError;
use thiserror::Error;
use uuid::Uuid;

/// Storage-level errors raised by a [`crate::store::LedgerStore`] backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database query error
    #[error("Query error: {0}")]
    Query(SqlxError),

    /// Unique constraint hit (idempotency keys, gateway references)
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Foreign key or check constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A stored value could not be decoded into its domain type
    #[error("Corrupt row: {0}")]
    Decode(String),

    /// The store transaction was used after commit
    #[error("Transaction already closed")]
    TransactionClosed,
}

impl From<SqlxError> for StoreError {
    fn from(err: SqlxError) -> Self {
        match &err {
            SqlxError::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                match code.as_deref() {
                    // unique_violation
                    Some("23505") => StoreError::Duplicate(db_err.message().to_string()),
                    // foreign_key_violation, check_violation
                    Some("23503") | Some("23514") => {
                        StoreError::ConstraintViolation(db_err.message().to_string())
                    }
                    _ => StoreError::Query(err),
                }
            }
            SqlxError::ColumnDecode { .. } | SqlxError::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            _ => StoreError::Query(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed outcomes of the ledger's public operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds in {account_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        account_id: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Wallet {0} is frozen")]
    WalletFrozen(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Idempotency key already used; resolved into a replay at the service boundary
    #[error("Duplicate reference {reference_type}/{reference_id} on {account_id}")]
    DuplicateReference {
        account_id: String,
        reference_type: String,
        reference_id: String,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("External reference mismatch: {0}")]
    ExternalReferenceMismatch(String),

    #[error("Withdrawal limit exceeded for {account_id}: {period} limit {limit}, already withdrawn {used}, requested {requested}")]
    WithdrawalLimitExceeded {
        account_id: String,
        period: &'static str,
        limit: Decimal,
        used: Decimal,
        requested: Decimal,
    },

    #[error("Escrow over-release on {account_id}: held {held}, released {released}, requested {requested}")]
    EscrowOverRelease {
        account_id: String,
        held: Decimal,
        released: Decimal,
        requested: Decimal,
    },

    #[error("Partner {0} has no pending settlement")]
    NothingToSettle(String),

    #[error("Settlement batch {batch_id} is still open for partner {partner_id}")]
    SettlementInProgress { partner_id: String, batch_id: Uuid },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Expected business outcomes, not faults
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds { .. }
                | LedgerError::WalletFrozen(_)
                | LedgerError::WithdrawalLimitExceeded { .. }
                | LedgerError::NothingToSettle(_)
        )
    }

    /// Whether a caller may retry the same request later.
    ///
    /// State machine violations are never retried: a retry could turn into a
    /// second payout.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::InvalidStateTransition { .. } => false,
            LedgerError::Store(StoreError::Query(_)) => true,
            LedgerError::Store(StoreError::TransactionClosed) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code for API consumers
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::WalletFrozen(_) => "wallet_frozen",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::DuplicateReference { .. } => "duplicate_reference",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::InvalidStateTransition { .. } => "invalid_state_transition",
            LedgerError::ExternalReferenceMismatch(_) => "external_reference_mismatch",
            LedgerError::WithdrawalLimitExceeded { .. } => "withdrawal_limit_exceeded",
            LedgerError::EscrowOverRelease { .. } => "escrow_over_release",
            LedgerError::NothingToSettle(_) => "nothing_to_settle",
            LedgerError::SettlementInProgress { .. } => "settlement_in_progress",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Unauthorized(_) => "unauthorized",
            LedgerError::Validation(_) => "validation_error",
            LedgerError::Store(_) => "store_error",
        }
    }
}

/// Process-level errors for the service binary
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger operation errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Socket and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Message(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Check if error is a database connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AppError::Database(DatabaseError::PoolCreation(_))
                | AppError::Database(DatabaseError::ConnectionTimeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transition_is_not_retryable() {
        let err = LedgerError::InvalidStateTransition {
            entity: "settlement_batch",
            id: Uuid::new_v4(),
            from: "paid".to_string(),
            to: "approved".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_business_outcome());
        assert_eq!(err.code(), "invalid_state_transition");
    }

    #[test]
    fn test_funds_outcomes_are_business_outcomes() {
        let err = LedgerError::InsufficientFunds {
            account_id: "u1".to_string(),
            available: Decimal::new(10, 0),
            requested: Decimal::new(20, 0),
        };
        assert!(err.is_business_outcome());
        assert!(LedgerError::WalletFrozen("u1".to_string()).is_business_outcome());
        assert!(!LedgerError::AccountNotFound("u1".to_string()).is_business_outcome());
    }

    #[test]
    fn test_row_not_found_maps_to_query() {
        let err: StoreError = SqlxError::RowNotFound.into();
        assert!(matches!(err, StoreError::Query(_)));
    }
}
