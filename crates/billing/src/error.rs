//! Billing errors

use thiserror::Error;

use crate::coupons::CouponRejection;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the billing subsystem
///
/// Variants fall into three groups that callers map differently:
/// validation failures carry a specific reason for the user, upstream
/// failures are reported as a generic processing error, and internal
/// failures are logged and hidden.
#[derive(Error, Debug)]
pub enum BillingError {
    // Validation
    #[error("{0}")]
    CouponRejected(CouponRejection),

    #[error("coupon {0} not found")]
    CouponNotFound(String),

    #[error("coupon {0} already exists")]
    CouponExists(String),

    #[error("no active subscription")]
    NoActiveSubscription,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Upstream
    #[error("payment processing failed")]
    PaymentProcessing,

    #[error("gateway error: {0}")]
    Gateway(String),

    // Webhooks
    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("webhook payload invalid: {0}")]
    WebhookPayload(String),

    // Internal
    #[error("failed to create subscription")]
    SubscriptionFailed,

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Caller-facing validation failure (bad coupon state, missing linkage)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::CouponRejected(_)
                | Self::CouponNotFound(_)
                | Self::CouponExists(_)
                | Self::NoActiveSubscription
                | Self::InvalidInput(_)
        )
    }

    /// Failure reported by (or while talking to) the payment gateway
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::PaymentProcessing | Self::Gateway(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::Gateway(e.to_string())
    }
}
