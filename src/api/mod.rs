//! JSON HTTP surface over the ledger services.
//!
//! Handlers are thin: they deserialize, call one service operation and map
//! the typed [`LedgerError`] onto a status code.

pub mod routes;

use crate::error::LedgerError;
use crate::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;

/// Build the application router with request tracing
pub fn build_router(state: AppState) -> Router {
    routes::routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===== Error Handling =====

#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            LedgerError::InsufficientFunds { .. }
            | LedgerError::WithdrawalLimitExceeded { .. }
            | LedgerError::EscrowOverRelease { .. }
            | LedgerError::NothingToSettle(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::WalletFrozen(_) => StatusCode::LOCKED,
            LedgerError::InvalidStateTransition { .. }
            | LedgerError::ExternalReferenceMismatch(_)
            | LedgerError::SettlementInProgress { .. }
            | LedgerError::DuplicateReference { .. } => StatusCode::CONFLICT,
            LedgerError::AccountNotFound(_) | LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidAmount(_) | LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::Unauthorized(_) => StatusCode::FORBIDDEN,
            LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            LedgerError::Store(err) => {
                tracing::error!("Store error: {}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": self.0.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use rust_decimal::Decimal;

    #[test]
    fn test_error_status_mapping() {
        let funds = ApiError(LedgerError::InsufficientFunds {
            account_id: "u1".to_string(),
            available: Decimal::ZERO,
            requested: Decimal::ONE,
        });
        assert_eq!(funds.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            ApiError(LedgerError::WalletFrozen("u1".to_string())).status(),
            StatusCode::LOCKED
        );
        assert_eq!(
            ApiError(LedgerError::ExternalReferenceMismatch("x".to_string())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(LedgerError::Unauthorized("x".to_string())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError(LedgerError::Store(StoreError::TransactionClosed)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
