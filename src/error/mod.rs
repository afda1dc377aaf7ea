//! Centralized error handling for the reconciliation engine
//!
//! Every failure the engine can observe maps onto one [`ReconcileError`]
//! variant. None of them is fatal to the process: the orchestrator logs the
//! error, skips the offending event and, for transient failures, leaves the
//! cursor where it was so the block range is re-read on the next tick.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Reconciliation error type
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity {
        requested: Decimal,
        available: Decimal,
    },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ReconcileError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Transient failures are retried on the next tick; the state before the
    /// failed call is left untouched.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReconcileError::Rpc(_) | ReconcileError::Timeout(_) | ReconcileError::Database(_)
        )
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ReconcileError::NotFound { .. } => "NOT_FOUND",
            ReconcileError::InsufficientLiquidity { .. } => "INSUFFICIENT_LIQUIDITY",
            ReconcileError::Rpc(_) => "RPC_ERROR",
            ReconcileError::Timeout(_) => "TIMEOUT",
            ReconcileError::Database(_) => "DATABASE_ERROR",
            ReconcileError::Decode(_) => "DECODE_ERROR",
            ReconcileError::Arithmetic(_) => "ARITHMETIC_ERROR",
            ReconcileError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    /// HTTP status for the operational endpoints
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReconcileError::NotFound { .. } => StatusCode::NOT_FOUND,
            ReconcileError::InsufficientLiquidity { .. } | ReconcileError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ReconcileError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ReconcileError::Rpc(_) | ReconcileError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReconcileError::Decode(_) | ReconcileError::Arithmetic(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ReconcileError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.error_code(),
            message: self.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %body.message, code = body.code, "Server error occurred");
        }
        (status, Json(body)).into_response()
    }
}

// Convenience conversions from common error types

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        ReconcileError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for ReconcileError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ReconcileError::Timeout(err.to_string())
        } else {
            ReconcileError::Rpc(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Decode(format!("Invalid JSON: {}", err))
    }
}

impl From<validator::ValidationErrors> for ReconcileError {
    fn from(err: validator::ValidationErrors) -> Self {
        ReconcileError::Validation(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ReconcileError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ReconcileError::Timeout(err.to_string())
    }
}

/// Result type alias using ReconcileError
pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ReconcileError::not_found("Loan", "0x01").error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ReconcileError::Rpc("boom".to_string()).error_code(),
            "RPC_ERROR"
        );
        assert_eq!(
            ReconcileError::InsufficientLiquidity {
                requested: Decimal::new(50_000, 0),
                available: Decimal::new(40_000, 0),
            }
            .error_code(),
            "INSUFFICIENT_LIQUIDITY"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ReconcileError::Rpc("reset".to_string()).is_transient());
        assert!(ReconcileError::Timeout("eth_call".to_string()).is_transient());
        assert!(ReconcileError::Database("pool closed".to_string()).is_transient());

        assert!(!ReconcileError::not_found("User", "0xabc").is_transient());
        assert!(!ReconcileError::Decode("short word".to_string()).is_transient());
        assert!(!ReconcileError::Validation("amount".to_string()).is_transient());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ReconcileError::not_found("Loan", "0x01").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ReconcileError::Timeout("getLogs".to_string()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = ReconcileError::not_found("Loan", "0xdeadbeef");
        assert_eq!(err.to_string(), "Loan not found: 0xdeadbeef");
    }
}
