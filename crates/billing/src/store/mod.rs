//! Billing persistence
//!
//! The services in this crate talk to storage only through [`BillingStore`].
//! Two backends exist: Postgres for deployments and an in-memory store for
//! tests and local development.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::coupons::{Coupon, CouponUsage};
use crate::error::BillingResult;
use crate::payments::{PaymentRecord, PaymentStatus};
use crate::subscriptions::Subscription;

/// Minutes after which a webhook stuck in `processing` may be claimed again
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Final state recorded for a processed webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Success,
    Error,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Success => "success",
            WebhookOutcome::Error => "error",
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Insert a subscription unless the user already has one; `false` if one existed
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<bool>;

    /// Insert or replace the user's subscription
    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    // Coupons

    /// Insert a coupon unless the code is taken; `false` if it was
    async fn insert_coupon(&self, coupon: &Coupon) -> BillingResult<bool>;

    async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>>;

    async fn list_coupons(&self) -> BillingResult<Vec<Coupon>>;

    /// Set the active flag; `None` if the code is unknown
    async fn set_coupon_active(&self, code: &str, active: bool) -> BillingResult<Option<Coupon>>;

    async fn has_coupon_usage(&self, code: &str, user_id: Uuid) -> BillingResult<bool>;

    /// Atomically increment `current_uses` and append the usage row
    ///
    /// Fails with `CouponRejected` when the coupon is unknown, its cap has
    /// been reached, or the user already has a usage row. Nothing is written
    /// in that case.
    async fn redeem_coupon(&self, usage: &CouponUsage) -> BillingResult<()>;

    async fn list_coupon_usages(&self) -> BillingResult<Vec<CouponUsage>>;

    // Payments

    async fn record_payment(&self, payment: &PaymentRecord) -> BillingResult<()>;

    /// Update a payment found by its gateway id; `None` if no such payment
    async fn update_payment_status(
        &self,
        gateway_payment_id: &str,
        status: PaymentStatus,
    ) -> BillingResult<Option<PaymentRecord>>;

    async fn list_payments(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>>;

    // Webhook events

    /// Claim exclusive processing rights for an event key
    ///
    /// Returns `false` when the event was already processed successfully or
    /// is being processed by someone else. Events that errored, or that have
    /// been stuck in `processing` past the timeout, can be claimed again.
    async fn claim_webhook_event(&self, event_key: &str, event_type: &str) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        event_key: &str,
        outcome: WebhookOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}
