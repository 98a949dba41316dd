use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error body returned by every rejected request.
///
/// `code` is stable and meant for client branching; `message` is for humans
/// and may change between releases.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Machine-readable reason code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// RFC 3339 timestamp when the error was produced
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Cancellation window closed: {0}")]
    CancellationWindowClosed(String),

    #[error("Not assigned: {0}")]
    NotAssigned(String),

    #[error("Not eligible: {0}")]
    NotEligible(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Invalid OTP: {0}")]
    InvalidOtp(String),

    #[error("OTP attempts exceeded: {0}")]
    OtpAttemptsExceeded(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Convenience constructor for wrapping string-based database errors.
    pub fn database_error_message(message: impl Into<String>) -> Self {
        ServiceError::DatabaseError(DbErr::Custom(message.into()))
    }

    /// Stable reason code, independent of the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::CancellationWindowClosed(_) => "cancellation_window_closed",
            Self::NotAssigned(_) => "not_assigned",
            Self::NotEligible(_) => "not_eligible",
            Self::InvalidStage(_) => "invalid_stage",
            Self::InvalidOtp(_) => "invalid_otp",
            Self::OtpAttemptsExceeded(_) => "otp_attempts_exceeded",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::PaymentFailed(_) => "payment_failed",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::NotAssigned(_) => StatusCode::FORBIDDEN,
            Self::InvalidTransition(_)
            | Self::CancellationWindowClosed(_)
            | Self::NotEligible(_)
            | Self::InvalidStage(_)
            | Self::InvalidOtp(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::OtpAttemptsExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientStock(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }

    /// Guard and validation failures are deterministic; retrying them unchanged never helps.
    pub fn is_deterministic_rejection(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_)
                | Self::Unauthorized(_)
                | Self::Forbidden(_)
                | Self::InvalidTransition(_)
                | Self::CancellationWindowClosed(_)
                | Self::NotAssigned(_)
                | Self::NotEligible(_)
                | Self::InvalidStage(_)
                | Self::InvalidOtp(_)
                | Self::OtpAttemptsExceeded(_)
        )
    }

    /// A write that lost a race: an optimistic version miss, or the database
    /// refusing a concurrent writer (SQLite busy, Postgres serialization
    /// failure or deadlock). Re-running the operation re-reads the winner's state.
    pub fn is_write_conflict(&self) -> bool {
        match self {
            Self::ConcurrentModification(_) => true,
            Self::DatabaseError(err) => {
                let message = err.to_string().to_ascii_lowercase();
                ["is locked", "database is busy", "could not serialize", "deadlock detected"]
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
