//! In-memory store
//!
//! All tables sit behind one mutex, so every trait method is atomic with
//! respect to the others. Data is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingStore, WebhookOutcome, WEBHOOK_PROCESSING_TIMEOUT_MINUTES};
use crate::coupons::{Coupon, CouponRejection, CouponUsage};
use crate::error::{BillingError, BillingResult};
use crate::payments::{PaymentRecord, PaymentStatus};
use crate::subscriptions::Subscription;

#[derive(Debug, Clone)]
struct WebhookEventState {
    processing_result: &'static str,
    processing_started_at: OffsetDateTime,
}

#[derive(Default)]
struct Tables {
    subscriptions: HashMap<Uuid, Subscription>,
    coupons: HashMap<String, Coupon>,
    coupon_usages: Vec<CouponUsage>,
    payments: Vec<PaymentRecord>,
    webhook_events: HashMap<String, WebhookEventState>,
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    tables: Mutex<Tables>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.subscriptions.contains_key(&subscription.user_id) {
            return Ok(false);
        }
        tables
            .subscriptions
            .insert(subscription.user_id, subscription.clone());
        Ok(true)
    }

    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .subscriptions
            .insert(subscription.user_id, subscription.clone());
        Ok(())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self.tables.lock().await.subscriptions.values().cloned().collect())
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.coupons.contains_key(&coupon.code) {
            return Ok(false);
        }
        tables.coupons.insert(coupon.code.clone(), coupon.clone());
        Ok(true)
    }

    async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>> {
        Ok(self.tables.lock().await.coupons.get(code).cloned())
    }

    async fn list_coupons(&self) -> BillingResult<Vec<Coupon>> {
        Ok(self.tables.lock().await.coupons.values().cloned().collect())
    }

    async fn set_coupon_active(&self, code: &str, active: bool) -> BillingResult<Option<Coupon>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.coupons.get_mut(code).map(|coupon| {
            coupon.is_active = active;
            coupon.clone()
        }))
    }

    async fn has_coupon_usage(&self, code: &str, user_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .coupon_usages
            .iter()
            .any(|usage| usage.coupon_code == code && usage.user_id == user_id))
    }

    async fn redeem_coupon(&self, usage: &CouponUsage) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;

        let already_used = tables
            .coupon_usages
            .iter()
            .any(|u| u.coupon_code == usage.coupon_code && u.user_id == usage.user_id);

        let coupon = tables
            .coupons
            .get_mut(&usage.coupon_code)
            .ok_or(BillingError::CouponRejected(CouponRejection::NotFound))?;

        if coupon.is_exhausted() {
            return Err(BillingError::CouponRejected(CouponRejection::Exhausted));
        }
        if already_used {
            return Err(BillingError::CouponRejected(CouponRejection::AlreadyUsed));
        }

        coupon.current_uses += 1;
        tables.coupon_usages.push(usage.clone());
        Ok(())
    }

    async fn list_coupon_usages(&self) -> BillingResult<Vec<CouponUsage>> {
        Ok(self.tables.lock().await.coupon_usages.clone())
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        self.tables.lock().await.payments.push(payment.clone());
        Ok(())
    }

    async fn update_payment_status(
        &self,
        gateway_payment_id: &str,
        status: PaymentStatus,
    ) -> BillingResult<Option<PaymentRecord>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter_mut()
            .find(|p| p.gateway_payment_id.as_deref() == Some(gateway_payment_id))
            .map(|payment| {
                payment.status = status;
                payment.updated_at = OffsetDateTime::now_utc();
                payment.clone()
            }))
    }

    async fn list_payments(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn claim_webhook_event(&self, event_key: &str, _event_type: &str) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES);

        let claimable = match tables.webhook_events.get(event_key) {
            None => true,
            Some(event) => {
                event.processing_result == WebhookOutcome::Error.as_str()
                    || (event.processing_result == "processing"
                        && event.processing_started_at < stuck_before)
            }
        };

        if claimable {
            tables.webhook_events.insert(
                event_key.to_string(),
                WebhookEventState {
                    processing_result: "processing",
                    processing_started_at: now,
                },
            );
        }
        Ok(claimable)
    }

    async fn finish_webhook_event(
        &self,
        event_key: &str,
        outcome: WebhookOutcome,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(event) = self.tables.lock().await.webhook_events.get_mut(event_key) {
            event.processing_result = outcome.as_str();
        }
        Ok(())
    }
}
