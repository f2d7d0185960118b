//! Billing orchestrator
//!
//! Drives the subscription lifecycle across the coupon ledger, discount
//! calculator, subscription store and payment gateway:
//!
//! ```text
//! NO_SUBSCRIPTION -> TRIAL -> ACTIVE <-> CANCELLED
//! ```
//!
//! A coupon is validated before any charge and redeemed exactly once, only
//! after the subscription has been activated. Nothing is compensated: if a
//! later step fails, earlier gateway calls stay in place.
//!
//! The discounted price is fixed at validation time, while the use is only
//! counted by the atomic redeem after activation. Two users racing for the
//! last use of a capped coupon are therefore both charged the discounted
//! price. The cap still holds: the lost redemption is logged and leaves no
//! usage row.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Plan;
use crate::coupons::{CouponLedger, CouponRejection, CouponValidation, ValidCoupon};
use crate::discount::{self, DiscountOutcome};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{json_id, PaymentGateway, PaymentRequest, RecurringChargeRequest};
use crate::payments::{PaymentRecord, PaymentStatus};
use crate::store::BillingStore;
use crate::subscriptions::{period_end, Subscription, SubscriptionStatus, SubscriptionStore};
use crate::webhooks::{GatewayNotification, NotificationTopic};

/// Status of a user's subscription at one instant
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionOverview {
    pub subscription: Subscription,
    pub is_active: bool,
    pub days_remaining: Option<i64>,
    pub requires_payment: bool,
}

/// Input for starting a paid subscription
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub email: String,
    /// Must match the configured plan when given
    pub plan_id: Option<String>,
    pub payment_method_id: String,
    pub coupon_code: Option<String>,
}

/// Result of a create attempt that reached the gateway
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// First payment approved and subscription active
    Activated {
        subscription: Subscription,
        payment_id: Option<String>,
    },
    /// Charge accepted but not approved yet
    Pending {
        payment_status: String,
        payment_id: Option<String>,
    },
}

/// Price preview for a coupon
#[derive(Debug, Clone)]
pub enum CouponQuote {
    Valid {
        coupon: ValidCoupon,
        original_price: Decimal,
        outcome: DiscountOutcome,
    },
    Invalid(CouponRejection),
}

pub struct BillingOrchestrator {
    plan: Plan,
    coupons: CouponLedger,
    subscriptions: SubscriptionStore,
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingOrchestrator {
    pub fn new(
        plan: Plan,
        coupons: CouponLedger,
        subscriptions: SubscriptionStore,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            plan,
            coupons,
            subscriptions,
            store,
            gateway,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Current status, provisioning a trial on first lookup
    pub async fn subscription_status(&self, user_id: Uuid) -> BillingResult<SubscriptionOverview> {
        let now = OffsetDateTime::now_utc();
        let subscription = match self.subscriptions.get(user_id).await? {
            Some(subscription) => subscription,
            None => self.subscriptions.create_trial_at(user_id, now).await?,
        };

        let is_active = subscription.is_active_at(now);
        Ok(SubscriptionOverview {
            days_remaining: subscription.days_remaining_at(now),
            is_active,
            requires_payment: !is_active,
            subscription,
        })
    }

    /// Validate a coupon and preview its effect on the plan price
    pub async fn quote_coupon(&self, code: &str, user_id: Uuid) -> BillingResult<CouponQuote> {
        match self.coupons.validate(code, user_id).await? {
            CouponValidation::Valid(coupon) => {
                let outcome = discount::apply(self.plan.price, Some(coupon.discount()));
                Ok(CouponQuote::Valid {
                    coupon,
                    original_price: discount::round_currency(self.plan.price),
                    outcome,
                })
            }
            CouponValidation::Invalid(rejection) => Ok(CouponQuote::Invalid(rejection)),
        }
    }

    /// Charge the first cycle and activate the subscription
    pub async fn create_subscription(&self, input: CreateSubscription) -> BillingResult<CreateOutcome> {
        let user_id = input.user_id;

        if let Some(plan_id) = &input.plan_id {
            if plan_id != &self.plan.id {
                return Err(BillingError::InvalidInput(format!("unknown plan '{}'", plan_id)));
            }
        }

        let coupon = match &input.coupon_code {
            Some(code) => match self.coupons.validate(code, user_id).await? {
                CouponValidation::Valid(coupon) => Some(coupon),
                CouponValidation::Invalid(rejection) => {
                    tracing::info!(
                        user_id = %user_id,
                        coupon_code = %code,
                        reason = rejection.code(),
                        "Coupon rejected before charge"
                    );
                    return Err(BillingError::CouponRejected(rejection));
                }
            },
            None => None,
        };

        let pricing = discount::apply(self.plan.price, coupon.as_ref().map(ValidCoupon::discount));

        // Paid month plus free months; refused before anything is charged
        let months = pricing.free_months.checked_add(1).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "{} free months is out of range",
                pricing.free_months
            ))
        })?;
        let recurring_start = period_end(OffsetDateTime::now_utc(), months).map_err(|e| {
            tracing::warn!(
                user_id = %user_id,
                months = months,
                "Subscription period out of range, nothing charged"
            );
            e
        })?;

        tracing::info!(
            user_id = %user_id,
            coupon_code = ?coupon.as_ref().map(|c| c.code.as_str()),
            base_price = %self.plan.price,
            final_price = %pricing.final_price,
            free_months = pricing.free_months,
            "Requesting first payment"
        );

        let payment = self
            .gateway
            .create_payment(&PaymentRequest {
                amount: pricing.final_price,
                description: self.plan.description.clone(),
                payer_email: input.email.clone(),
                payment_method_id: input.payment_method_id.clone(),
            })
            .await
            .map_err(|e| processing_failure(user_id, "create_payment", e))?;

        if !payment.is_success() {
            tracing::warn!(
                user_id = %user_id,
                status_code = payment.status_code,
                "First payment refused by gateway"
            );
            return Err(BillingError::PaymentProcessing);
        }

        let payment_id = payment.id();
        let payment_status = payment.status().unwrap_or("pending").to_string();

        let mut record = PaymentRecord::new(
            user_id,
            pricing.final_price,
            PaymentStatus::from_gateway(&payment_status),
        );
        record.payment_method = Some(input.payment_method_id.clone());
        record.gateway_payment_id = payment_id.clone();
        record.coupon_code = coupon.as_ref().map(|c| c.code.clone());
        record.discount_applied = pricing.discount_amount;
        self.store
            .record_payment(&record)
            .await
            .map_err(|e| internal_failure(user_id, "record_payment", e))?;

        if payment_status != PaymentStatus::Approved.as_str() {
            tracing::info!(
                user_id = %user_id,
                payment_id = ?payment_id,
                payment_status = %payment_status,
                "First payment not approved yet"
            );
            return Ok(CreateOutcome::Pending {
                payment_status,
                payment_id,
            });
        }

        let recurring = self
            .gateway
            .create_recurring_charge(&RecurringChargeRequest {
                payer_email: input.email.clone(),
                base_price: self.plan.price,
                currency: self.plan.currency.clone(),
                payer_id: payment.body.pointer("/payer/id").and_then(json_id),
                payment_method_id: input.payment_method_id.clone(),
                description: self.plan.description.clone(),
                start_date: recurring_start,
            })
            .await
            .map_err(|e| processing_failure(user_id, "create_recurring_charge", e))?;

        if !recurring.is_success() {
            tracing::error!(
                user_id = %user_id,
                payment_id = ?payment_id,
                status_code = recurring.status_code,
                "Recurring charge refused after approved payment"
            );
            return Err(BillingError::PaymentProcessing);
        }

        let gateway_subscription_id = recurring.id().ok_or_else(|| {
            internal_failure(
                user_id,
                "create_recurring_charge",
                BillingError::Gateway("recurring charge response without id".to_string()),
            )
        })?;

        let subscription = self
            .subscriptions
            .activate(user_id, &self.plan.id, &gateway_subscription_id, months)
            .await
            .map_err(|e| internal_failure(user_id, "activate", e))?;

        if let Some(coupon) = &coupon {
            match self
                .coupons
                .redeem(&coupon.code, user_id, pricing.discount_amount)
                .await
            {
                Ok(_) => {}
                Err(BillingError::CouponRejected(rejection)) => {
                    // Lost a race for the last use or a concurrent attempt by
                    // the same user; the payment already went through.
                    tracing::error!(
                        user_id = %user_id,
                        coupon_code = %coupon.code,
                        reason = rejection.code(),
                        "Coupon redemption failed after activation"
                    );
                }
                Err(e) => return Err(internal_failure(user_id, "redeem_coupon", e)),
            }
        }

        tracing::info!(
            user_id = %user_id,
            payment_id = ?payment_id,
            gateway_subscription_id = %gateway_subscription_id,
            months = months,
            "Subscription created"
        );

        Ok(CreateOutcome::Activated {
            subscription,
            payment_id,
        })
    }

    /// Cancel an active subscription, remotely first and then locally
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .subscriptions
            .get(user_id)
            .await?
            .filter(|sub| sub.status == SubscriptionStatus::Active)
            .ok_or(BillingError::NoActiveSubscription)?;

        if let Some(gateway_id) = &subscription.gateway_subscription_id {
            let response = self
                .gateway
                .cancel_recurring_charge(gateway_id)
                .await
                .map_err(|e| processing_failure(user_id, "cancel_recurring_charge", e))?;

            if !response.is_success() {
                tracing::error!(
                    user_id = %user_id,
                    gateway_subscription_id = %gateway_id,
                    status_code = response.status_code,
                    "Gateway refused to cancel recurring charge; local state unchanged"
                );
                return Err(BillingError::PaymentProcessing);
            }
        }

        self.subscriptions
            .cancel(user_id, reason)
            .await?
            .ok_or(BillingError::NoActiveSubscription)
    }

    /// Reconcile a gateway notification against the payment ledger
    ///
    /// Only the payment status is updated; subscription records are never
    /// changed from here.
    pub async fn reconcile_webhook(&self, notification: &GatewayNotification) -> BillingResult<()> {
        match &notification.topic {
            NotificationTopic::Payment => {
                let response = self.gateway.get_payment(&notification.data_id).await?;
                if !response.is_success() {
                    return Err(BillingError::Gateway(format!(
                        "payment lookup returned {}",
                        response.status_code
                    )));
                }

                let status = response.status().unwrap_or("pending").to_string();
                tracing::info!(
                    payment_id = %notification.data_id,
                    status = %status,
                    amount = ?response.body.get("transaction_amount").and_then(|v| v.as_f64()),
                    "Payment notification received"
                );

                let updated = self
                    .store
                    .update_payment_status(&notification.data_id, PaymentStatus::from_gateway(&status))
                    .await?;
                match updated {
                    Some(record) => tracing::info!(
                        payment_id = %notification.data_id,
                        user_id = %record.user_id,
                        status = %record.status,
                        "Payment ledger updated"
                    ),
                    None => tracing::debug!(
                        payment_id = %notification.data_id,
                        "Notified payment is not in the ledger"
                    ),
                }
                Ok(())
            }
            NotificationTopic::SubscriptionPreapproval => {
                let response = self
                    .gateway
                    .get_recurring_charge(&notification.data_id)
                    .await?;
                if !response.is_success() {
                    return Err(BillingError::Gateway(format!(
                        "recurring charge lookup returned {}",
                        response.status_code
                    )));
                }
                tracing::info!(
                    gateway_subscription_id = %notification.data_id,
                    status = ?response.status(),
                    "Recurring charge notification received"
                );
                Ok(())
            }
            NotificationTopic::Other(topic) => {
                tracing::info!(
                    topic = %topic,
                    data_id = %notification.data_id,
                    "Unhandled webhook topic"
                );
                Ok(())
            }
        }
    }
}

fn processing_failure(user_id: Uuid, step: &str, err: BillingError) -> BillingError {
    tracing::error!(user_id = %user_id, step = step, error = %err, "Gateway call failed");
    BillingError::PaymentProcessing
}

fn internal_failure(user_id: Uuid, step: &str, err: BillingError) -> BillingError {
    tracing::error!(user_id = %user_id, step = step, error = %err, "Subscription creation failed");
    BillingError::SubscriptionFailed
}
