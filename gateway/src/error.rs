//! Gateway error handling and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Error surfaced by the ledger
    #[error(transparent)]
    Ledger(#[from] credit_ledger::Error),

    /// External processor call failed; no ledger mutation happened
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// The processor reported a non-completed capture; the payment is
    /// left pending and the client may retry
    #[error("Capture declined: {0}")]
    CaptureDeclined(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Gateway(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        use credit_ledger::Error as LedgerError;

        let (status, body) = match &self {
            GatewayError::Ledger(LedgerError::InvalidArgument(msg)) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg, "timestamp": Utc::now() }),
            ),
            GatewayError::Ledger(LedgerError::InsufficientBalance {
                required,
                available,
            }) => (
                StatusCode::CONFLICT,
                serde_json::json!({
                    "error": self.to_string(),
                    "required": required,
                    "available": available,
                    "timestamp": Utc::now(),
                }),
            ),
            GatewayError::Ledger(
                LedgerError::OrderNotFound(_)
                | LedgerError::PaymentNotFound(_)
                | LedgerError::CommissionNotFound(_),
            ) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": self.to_string(), "timestamp": Utc::now() }),
            ),
            GatewayError::Ledger(LedgerError::InvalidTransition(msg)) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": msg, "timestamp": Utc::now() }),
            ),
            GatewayError::Gateway(_) | GatewayError::CaptureDeclined(_) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "error": self.to_string(), "timestamp": Utc::now() }),
            ),
            GatewayError::Ledger(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": self.to_string(), "timestamp": Utc::now() }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
