//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fotiva_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Payment processing failed")]
    PaymentProcessing,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentProcessing => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::CouponRejected(rejection) => {
                ApiError::Validation(rejection.message().to_string())
            }
            BillingError::CouponNotFound(_) => ApiError::NotFound(e.to_string()),
            BillingError::CouponExists(_) => ApiError::Conflict(e.to_string()),
            BillingError::NoActiveSubscription
            | BillingError::InvalidInput(_)
            | BillingError::WebhookPayload(_) => ApiError::Validation(e.to_string()),
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::PaymentProcessing | BillingError::Gateway(_) => {
                tracing::warn!(error = %e, "Upstream gateway failure");
                ApiError::PaymentProcessing
            }
            BillingError::SubscriptionFailed => {
                ApiError::Internal("Failed to create subscription".to_string())
            }
            BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
                tracing::error!(error = %e, "Internal billing error");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
