use crate::{errors::ServiceError, ApiResponse};
use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Result of a handler that creates a resource.
pub type CreatedResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ServiceError>;

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input.validate().map_err(ServiceError::from)
}

/// Body for actions that only need a free-text reason.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ReasonBody {
    #[validate(length(min = 1, max = 1000, message = "a reason is required"))]
    pub reason: String,
}
