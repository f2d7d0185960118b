// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Fotiva Billing Module
//!
//! Subscription lifecycle for the photographer SaaS, on top of Mercado Pago.
//!
//! ## Features
//!
//! - **Trials**: 30-day trial provisioned on the first status lookup
//! - **Subscriptions**: First-cycle charge, recurring charge, activation, cancellation
//! - **Coupons**: Percentage, fixed and free-month coupons, once per user, capped uses
//! - **Webhooks**: Signed, idempotent intake of gateway notifications
//! - **Invariants**: Scheduled consistency checks over the billing tables

pub mod config;
pub mod coupons;
pub mod discount;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod orchestrator;
pub mod payments;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Config
pub use config::{BillingConfig, GatewayConfig, Plan};

// Coupons
pub use coupons::{
    normalize_code, Coupon, CouponLedger, CouponRejection, CouponUsage, CouponValidation,
    NewCoupon, ValidCoupon,
};

// Discount
pub use discount::{Discount, DiscountKind, DiscountOutcome};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    GatewayResponse, MercadoPagoClient, PaymentGateway, PaymentRequest, RecurringChargeRequest,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Orchestrator
pub use orchestrator::{
    BillingOrchestrator, CouponQuote, CreateOutcome, CreateSubscription, SubscriptionOverview,
};

// Payments
pub use payments::{PaymentRecord, PaymentStatus};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionStatus, SubscriptionStore};

// Webhooks
pub use webhooks::{GatewayNotification, WebhookDisposition, WebhookHandler, WebhookHeaders};

use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub coupons: CouponLedger,
    pub subscriptions: SubscriptionStore,
    pub orchestrator: Arc<BillingOrchestrator>,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service talking to Mercado Pago, configured from the environment
    pub fn from_env(store: Arc<dyn BillingStore>) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let gateway = Arc::new(MercadoPagoClient::new(config.gateway.clone()));
        Ok(Self::new(config, store, gateway))
    }

    /// Create a billing service with explicit config and gateway
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let coupons = CouponLedger::new(store.clone());
        let subscriptions = SubscriptionStore::new(store.clone(), config.trial_days);
        let orchestrator = Arc::new(BillingOrchestrator::new(
            config.plan,
            coupons.clone(),
            subscriptions.clone(),
            store.clone(),
            gateway,
        ));

        Self {
            coupons,
            subscriptions,
            webhooks: WebhookHandler::new(
                store.clone(),
                orchestrator.clone(),
                config.gateway.webhook_secret,
            ),
            invariants: InvariantChecker::new(store),
            orchestrator,
        }
    }
}
