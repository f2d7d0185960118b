// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests boundary conditions and race conditions in:
//! - Coupon caps, per-user redemption and validity windows
//! - The create / cancel subscription flows against a scripted gateway
//! - Webhook intake idempotency and signature enforcement

#[cfg(test)]
mod support {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use uuid::Uuid;

    use crate::config::{BillingConfig, GatewayConfig};
    use crate::coupons::NewCoupon;
    use crate::discount::DiscountKind;
    use crate::error::BillingResult;
    use crate::gateway::{GatewayResponse, PaymentGateway, PaymentRequest, RecurringChargeRequest};
    use crate::store::InMemoryBillingStore;
    use crate::BillingService;

    #[derive(Debug, Clone)]
    pub enum GatewayCall {
        Payment(PaymentRequest),
        Recurring(RecurringChargeRequest),
        Cancel(String),
        GetRecurring(String),
        GetPayment(String),
    }

    /// In-process gateway returning canned responses and recording calls
    pub struct ScriptedGateway {
        pub payment: GatewayResponse,
        pub recurring: GatewayResponse,
        pub cancel: GatewayResponse,
        pub lookup: GatewayResponse,
        pub calls: Mutex<Vec<GatewayCall>>,
    }

    pub fn reply(status_code: u16, body: Value) -> GatewayResponse {
        GatewayResponse { status_code, body }
    }

    impl ScriptedGateway {
        /// Everything approved
        pub fn approving() -> Self {
            Self {
                payment: reply(201, json!({"id": 5001, "status": "approved", "payer": {"id": 77}})),
                recurring: reply(201, json!({"id": "pre-5001", "status": "authorized"})),
                cancel: reply(200, json!({"id": "pre-5001", "status": "cancelled"})),
                lookup: reply(200, json!({"id": 5001, "status": "approved", "transaction_amount": 9.95})),
                calls: Mutex::new(vec![]),
            }
        }

        pub fn calls(&self) -> Vec<GatewayCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn payments(&self) -> Vec<PaymentRequest> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    GatewayCall::Payment(request) => Some(request),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: GatewayCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<GatewayResponse> {
            self.record(GatewayCall::Payment(request.clone()));
            Ok(self.payment.clone())
        }

        async fn create_recurring_charge(
            &self,
            request: &RecurringChargeRequest,
        ) -> BillingResult<GatewayResponse> {
            self.record(GatewayCall::Recurring(request.clone()));
            Ok(self.recurring.clone())
        }

        async fn cancel_recurring_charge(&self, id: &str) -> BillingResult<GatewayResponse> {
            self.record(GatewayCall::Cancel(id.to_string()));
            Ok(self.cancel.clone())
        }

        async fn get_recurring_charge(&self, id: &str) -> BillingResult<GatewayResponse> {
            self.record(GatewayCall::GetRecurring(id.to_string()));
            Ok(self.lookup.clone())
        }

        async fn get_payment(&self, id: &str) -> BillingResult<GatewayResponse> {
            self.record(GatewayCall::GetPayment(id.to_string()));
            Ok(self.lookup.clone())
        }
    }

    pub struct Harness {
        pub billing: BillingService,
        pub gateway: Arc<ScriptedGateway>,
        pub store: Arc<InMemoryBillingStore>,
    }

    pub fn harness_with(gateway: ScriptedGateway, webhook_secret: Option<&str>) -> Harness {
        let mut gateway_config = GatewayConfig::new("TEST-token", "http://gateway.invalid");
        if let Some(secret) = webhook_secret {
            gateway_config = gateway_config.with_webhook_secret(secret);
        }

        let gateway = Arc::new(gateway);
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = BillingService::new(
            BillingConfig::new(gateway_config),
            store.clone(),
            gateway.clone(),
        );
        Harness {
            billing,
            gateway,
            store,
        }
    }

    pub fn harness(gateway: ScriptedGateway) -> Harness {
        harness_with(gateway, None)
    }

    pub fn coupon(code: &str, kind: DiscountKind, value: i64, max_uses: Option<i32>) -> NewCoupon {
        NewCoupon {
            code: code.to_string(),
            discount_type: kind,
            discount_value: Decimal::from(value),
            created_by: Uuid::new_v4(),
            max_uses,
            valid_from: None,
            valid_until: None,
        }
    }
}

#[cfg(test)]
mod coupon_tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::support::*;
    use crate::coupons::{CouponRejection, CouponValidation};
    use crate::discount::DiscountKind;
    use crate::error::BillingError;
    use crate::store::BillingStore;

    // =========================================================================
    // Cap of N: after N redemptions the next new user sees "exhausted"
    // =========================================================================
    #[tokio::test]
    async fn test_exhausted_after_max_uses() {
        let h = harness(ScriptedGateway::approving());
        let ledger = &h.billing.coupons;
        ledger
            .create(coupon("LIMITED", DiscountKind::Percentage, 10, Some(3)))
            .await
            .unwrap();

        for _ in 0..3 {
            let user = Uuid::new_v4();
            assert!(ledger.validate("LIMITED", user).await.unwrap().is_valid());
            ledger.redeem("LIMITED", user, Decimal::new(199, 2)).await.unwrap();
        }

        let result = ledger.validate("LIMITED", Uuid::new_v4()).await.unwrap();
        assert_eq!(result, CouponValidation::Invalid(CouponRejection::Exhausted));
    }

    // =========================================================================
    // Second validate after a redeem is "already used", every time
    // =========================================================================
    #[tokio::test]
    async fn test_already_used_is_stable() {
        let h = harness(ScriptedGateway::approving());
        let ledger = &h.billing.coupons;
        ledger
            .create(coupon("ONCEONLY", DiscountKind::Fixed, 5, None))
            .await
            .unwrap();
        let user = Uuid::new_v4();
        ledger.redeem("ONCEONLY", user, Decimal::from(5)).await.unwrap();

        for _ in 0..2 {
            let result = ledger.validate("onceonly", user).await.unwrap();
            assert_eq!(result, CouponValidation::Invalid(CouponRejection::AlreadyUsed));
        }
        // Another user is unaffected
        assert!(ledger.validate("ONCEONLY", Uuid::new_v4()).await.unwrap().is_valid());
    }

    // =========================================================================
    // Past valid_until is "expired" even when the cap is also reached
    // =========================================================================
    #[tokio::test]
    async fn test_expired_wins_over_exhausted() {
        let h = harness(ScriptedGateway::approving());
        let ledger = &h.billing.coupons;
        let now = OffsetDateTime::now_utc();
        let mut params = coupon("GONE", DiscountKind::Percentage, 20, Some(1));
        params.valid_from = Some(now - Duration::days(10));
        params.valid_until = Some(now - Duration::days(1));
        ledger.create(params).await.unwrap();
        ledger.redeem("GONE", Uuid::new_v4(), Decimal::ONE).await.unwrap();

        let result = ledger.validate("GONE", Uuid::new_v4()).await.unwrap();
        assert_eq!(result, CouponValidation::Invalid(CouponRejection::Expired));
    }

    // =========================================================================
    // Deactivate twice: both succeed, coupon stays inactive
    // =========================================================================
    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let h = harness(ScriptedGateway::approving());
        let ledger = &h.billing.coupons;
        ledger
            .create(coupon("OFF", DiscountKind::Fixed, 1, None))
            .await
            .unwrap();

        let first = ledger.deactivate("OFF").await.unwrap();
        let second = ledger.deactivate("off").await.unwrap();
        assert!(!first.is_active);
        assert!(!second.is_active);
    }

    // =========================================================================
    // Concurrent redemptions near the cap never overshoot it
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_redemptions_respect_cap() {
        use tokio::sync::Barrier;

        let h = harness(ScriptedGateway::approving());
        h.billing
            .coupons
            .create(coupon("RUSH", DiscountKind::Percentage, 50, Some(5)))
            .await
            .unwrap();

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];
        for _ in 0..10 {
            let ledger = h.billing.coupons.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger.redeem("RUSH", Uuid::new_v4(), Decimal::new(995, 2)).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(matches!(
                    err,
                    BillingError::CouponRejected(CouponRejection::Exhausted)
                )),
            }
        }

        assert_eq!(succeeded, 5);
        let stored = h.store.get_coupon("RUSH").await.unwrap().unwrap();
        assert_eq!(stored.current_uses, 5);
        assert_eq!(h.store.list_coupon_usages().await.unwrap().len(), 5);
    }

    // =========================================================================
    // Same user racing twice: one usage row, one increment
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_same_user_redeems_once() {
        let h = harness(ScriptedGateway::approving());
        h.billing
            .coupons
            .create(coupon("MINE", DiscountKind::Fixed, 3, None))
            .await
            .unwrap();
        let user = Uuid::new_v4();

        let a = h.billing.coupons.redeem("MINE", user, Decimal::from(3));
        let b = h.billing.coupons.redeem("MINE", user, Decimal::from(3));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

        let stored = h.store.get_coupon("MINE").await.unwrap().unwrap();
        assert_eq!(stored.current_uses, 1);
    }
}

#[cfg(test)]
mod subscription_flow_tests {
    use rust_decimal::Decimal;
    use serde_json::json;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::support::*;
    use crate::coupons::CouponRejection;
    use crate::discount::DiscountKind;
    use crate::error::BillingError;
    use crate::orchestrator::{CreateOutcome, CreateSubscription};
    use crate::payments::PaymentStatus;
    use crate::store::BillingStore;
    use crate::subscriptions::SubscriptionStatus;

    fn request(user_id: Uuid, coupon_code: Option<&str>) -> CreateSubscription {
        CreateSubscription {
            user_id,
            email: "ana@example.com".to_string(),
            plan_id: Some("monthly_19_90".to_string()),
            payment_method_id: "visa".to_string(),
            coupon_code: coupon_code.map(str::to_string),
        }
    }

    // =========================================================================
    // New user: status provisions a 30-day trial
    // =========================================================================
    #[tokio::test]
    async fn test_first_status_provisions_trial() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();

        let overview = h.billing.orchestrator.subscription_status(user).await.unwrap();
        assert_eq!(overview.subscription.status, SubscriptionStatus::Trial);
        assert_eq!(overview.days_remaining, Some(30));
        assert!(overview.is_active);
        assert!(!overview.requires_payment);

        // Second lookup reuses the record
        let again = h.billing.orchestrator.subscription_status(user).await.unwrap();
        assert_eq!(again.subscription.trial_end, overview.subscription.trial_end);
    }

    // =========================================================================
    // WELCOME50 on 19.90: charge 9.95, activate, redeem once with 9.95
    // =========================================================================
    #[tokio::test]
    async fn test_end_to_end_with_percentage_coupon() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();
        h.billing.orchestrator.subscription_status(user).await.unwrap();
        h.billing
            .coupons
            .create(coupon("WELCOME50", DiscountKind::Percentage, 50, Some(100)))
            .await
            .unwrap();

        let before = OffsetDateTime::now_utc();
        let outcome = h
            .billing
            .orchestrator
            .create_subscription(request(user, Some("welcome50")))
            .await
            .unwrap();

        let (subscription, payment_id) = match outcome {
            CreateOutcome::Activated {
                subscription,
                payment_id,
            } => (subscription, payment_id),
            other => panic!("expected activation, got {:?}", other),
        };
        assert_eq!(payment_id.as_deref(), Some("5001"));
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.plan_id, "monthly_19_90");
        assert_eq!(subscription.gateway_subscription_id.as_deref(), Some("pre-5001"));
        let end = subscription.subscription_end.unwrap();
        assert!(end >= before + Duration::days(30));
        assert!(end <= OffsetDateTime::now_utc() + Duration::days(30));

        let payments = h.gateway.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, Decimal::new(995, 2));

        let recurring: Vec<_> = h
            .gateway
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Recurring(request) => Some(request),
                _ => None,
            })
            .collect();
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].base_price, Decimal::new(1990, 2));
        assert_eq!(recurring[0].payer_id.as_deref(), Some("77"));

        let coupon = h.store.get_coupon("WELCOME50").await.unwrap().unwrap();
        assert_eq!(coupon.current_uses, 1);
        let usages = h.store.list_coupon_usages().await.unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].user_id, user);
        assert_eq!(usages[0].discount_applied, Decimal::new(995, 2));

        let ledger = h.store.list_payments(user).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, PaymentStatus::Approved);
        assert_eq!(ledger[0].coupon_code.as_deref(), Some("WELCOME50"));
        assert_eq!(ledger[0].gateway_payment_id.as_deref(), Some("5001"));
    }

    // =========================================================================
    // Rejected coupon: no gateway call, no state written
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_coupon_aborts_before_charge() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();
        h.billing.orchestrator.subscription_status(user).await.unwrap();

        let err = h
            .billing
            .orchestrator
            .create_subscription(request(user, Some("NOPE")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::CouponRejected(CouponRejection::NotFound)
        ));
        assert!(h.gateway.calls().is_empty());
        assert!(h.store.list_payments(user).await.unwrap().is_empty());
        let sub = h.store.get_subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
    }

    // =========================================================================
    // Declined first payment: generic processing error, coupon untouched
    // =========================================================================
    #[tokio::test]
    async fn test_gateway_refusal_writes_nothing() {
        let mut gateway = ScriptedGateway::approving();
        gateway.payment = reply(400, json!({"message": "cc_rejected"}));
        let h = harness(gateway);
        let user = Uuid::new_v4();
        h.billing
            .coupons
            .create(coupon("HALF", DiscountKind::Percentage, 50, None))
            .await
            .unwrap();

        let err = h
            .billing
            .orchestrator
            .create_subscription(request(user, Some("HALF")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentProcessing));

        assert!(h.store.get_subscription(user).await.unwrap().is_none());
        assert!(h.store.list_payments(user).await.unwrap().is_empty());
        assert_eq!(h.store.get_coupon("HALF").await.unwrap().unwrap().current_uses, 0);
    }

    // =========================================================================
    // Pending payment: no activation, no redemption
    // =========================================================================
    #[tokio::test]
    async fn test_pending_payment_does_not_activate() {
        let mut gateway = ScriptedGateway::approving();
        gateway.payment = reply(201, json!({"id": 6001, "status": "in_process"}));
        let h = harness(gateway);
        let user = Uuid::new_v4();
        h.billing.orchestrator.subscription_status(user).await.unwrap();
        h.billing
            .coupons
            .create(coupon("WAIT", DiscountKind::Fixed, 5, None))
            .await
            .unwrap();

        let outcome = h
            .billing
            .orchestrator
            .create_subscription(request(user, Some("WAIT")))
            .await
            .unwrap();
        match outcome {
            CreateOutcome::Pending {
                payment_status,
                payment_id,
            } => {
                assert_eq!(payment_status, "in_process");
                assert_eq!(payment_id.as_deref(), Some("6001"));
            }
            other => panic!("expected pending, got {:?}", other),
        }

        let sub = h.store.get_subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(h.store.get_coupon("WAIT").await.unwrap().unwrap().current_uses, 0);
        let ledger = h.store.list_payments(user).await.unwrap();
        assert_eq!(ledger[0].status, PaymentStatus::InProcess);
        assert_eq!(h.gateway.calls().len(), 1);
    }

    // =========================================================================
    // Recurring charge refused after approval: not activated, coupon kept
    // =========================================================================
    #[tokio::test]
    async fn test_recurring_failure_leaves_trial() {
        let mut gateway = ScriptedGateway::approving();
        gateway.recurring = reply(500, json!({}));
        let h = harness(gateway);
        let user = Uuid::new_v4();
        h.billing.orchestrator.subscription_status(user).await.unwrap();
        h.billing
            .coupons
            .create(coupon("KEEPME", DiscountKind::Fixed, 5, None))
            .await
            .unwrap();

        let err = h
            .billing
            .orchestrator
            .create_subscription(request(user, Some("KEEPME")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentProcessing));

        let sub = h.store.get_subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(h.store.get_coupon("KEEPME").await.unwrap().unwrap().current_uses, 0);
    }

    // =========================================================================
    // Free months: zero charge, 1 + N months, waived price recorded
    // =========================================================================
    #[tokio::test]
    async fn test_free_months_coupon() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();
        h.billing
            .coupons
            .create(coupon("FREE3", DiscountKind::FreeMonths, 3, None))
            .await
            .unwrap();

        let outcome = h
            .billing
            .orchestrator
            .create_subscription(request(user, Some("FREE3")))
            .await
            .unwrap();
        let CreateOutcome::Activated { subscription, .. } = outcome else {
            panic!("expected activation");
        };

        let period = subscription.subscription_end.unwrap() - subscription.subscription_start.unwrap();
        assert_eq!(period, Duration::days(120));
        assert_eq!(h.gateway.payments()[0].amount, Decimal::ZERO);

        let usages = h.store.list_coupon_usages().await.unwrap();
        assert_eq!(usages[0].discount_applied, Decimal::new(1990, 2));
    }

    // =========================================================================
    // Free months beyond any representable date: refused before charging
    // =========================================================================
    #[tokio::test]
    async fn test_huge_free_months_rejected_before_charge() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();
        h.billing
            .coupons
            .create(coupon("FOREVER", DiscountKind::FreeMonths, 1_000_000, None))
            .await
            .unwrap();
        h.billing
            .coupons
            .create(coupon("MAXED", DiscountKind::FreeMonths, i64::from(u32::MAX), None))
            .await
            .unwrap();

        for code in ["FOREVER", "MAXED"] {
            let err = h
                .billing
                .orchestrator
                .create_subscription(request(user, Some(code)))
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)));
            assert_eq!(h.store.get_coupon(code).await.unwrap().unwrap().current_uses, 0);
        }

        assert!(h.gateway.calls().is_empty());
        assert!(h.store.list_payments(user).await.unwrap().is_empty());
        assert!(h.store.get_subscription(user).await.unwrap().is_none());
    }

    // =========================================================================
    // Unknown plan id is rejected up front
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_plan_rejected() {
        let h = harness(ScriptedGateway::approving());
        let mut input = request(Uuid::new_v4(), None);
        input.plan_id = Some("yearly_199".to_string());

        let err = h
            .billing
            .orchestrator
            .create_subscription(input)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(h.gateway.calls().is_empty());
    }

    // =========================================================================
    // Cancel with failing gateway: stays active, no cancelled_at
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_gateway_failure_keeps_active() {
        let mut gateway = ScriptedGateway::approving();
        gateway.cancel = reply(503, json!({"message": "unavailable"}));
        let h = harness(gateway);
        let user = Uuid::new_v4();
        h.billing
            .orchestrator
            .create_subscription(request(user, None))
            .await
            .unwrap();

        let err = h
            .billing
            .orchestrator
            .cancel_subscription(user, Some("moving".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentProcessing));

        let sub = h.store.get_subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.cancelled_at.is_none());
        assert!(sub.auto_renew);
    }

    // =========================================================================
    // Cancel success: remote first, then local flag
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_active_subscription() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();
        h.billing
            .orchestrator
            .create_subscription(request(user, None))
            .await
            .unwrap();

        let cancelled = h
            .billing
            .orchestrator
            .cancel_subscription(user, Some("moving".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("moving"));

        assert!(h
            .gateway
            .calls()
            .iter()
            .any(|call| matches!(call, GatewayCall::Cancel(id) if id == "pre-5001")));

        // Nothing left to cancel
        let err = h
            .billing
            .orchestrator
            .cancel_subscription(user, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription));
    }

    // =========================================================================
    // Trial users and unknown users have nothing to cancel
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_requires_active() {
        let h = harness(ScriptedGateway::approving());
        let trial_user = Uuid::new_v4();
        h.billing.orchestrator.subscription_status(trial_user).await.unwrap();

        for user in [trial_user, Uuid::new_v4()] {
            let err = h
                .billing
                .orchestrator
                .cancel_subscription(user, None)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::NoActiveSubscription));
        }
        assert!(h.gateway.calls().is_empty());
    }

    // =========================================================================
    // Resubscribing after cancel measures the period from now
    // =========================================================================
    #[tokio::test]
    async fn test_reactivation_after_cancel() {
        let h = harness(ScriptedGateway::approving());
        let user = Uuid::new_v4();
        h.billing
            .orchestrator
            .create_subscription(request(user, None))
            .await
            .unwrap();
        h.billing.orchestrator.cancel_subscription(user, None).await.unwrap();

        let overview = h.billing.orchestrator.subscription_status(user).await.unwrap();
        assert!(!overview.is_active);
        assert!(overview.requires_payment);
        assert_eq!(overview.days_remaining, None);

        let before = OffsetDateTime::now_utc();
        let outcome = h
            .billing
            .orchestrator
            .create_subscription(request(user, None))
            .await
            .unwrap();
        let CreateOutcome::Activated { subscription, .. } = outcome else {
            panic!("expected activation");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(subscription.subscription_start.unwrap() >= before);
        // Audit fields from the cancellation stay in place
        assert!(subscription.cancelled_at.is_some());
    }

    // =========================================================================
    // Coupon preview uses the plan price
    // =========================================================================
    #[tokio::test]
    async fn test_quote_coupon() {
        use crate::orchestrator::CouponQuote;

        let h = harness(ScriptedGateway::approving());
        h.billing
            .coupons
            .create(coupon("FIVE", DiscountKind::Fixed, 5, None))
            .await
            .unwrap();

        match h.billing.orchestrator.quote_coupon("five", Uuid::new_v4()).await.unwrap() {
            CouponQuote::Valid {
                original_price,
                outcome,
                ..
            } => {
                assert_eq!(original_price, Decimal::new(1990, 2));
                assert_eq!(outcome.final_price, Decimal::new(1490, 2));
            }
            other => panic!("expected valid quote, got {:?}", other),
        }

        let quote = h
            .billing
            .orchestrator
            .quote_coupon("missing", Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(quote, CouponQuote::Invalid(CouponRejection::NotFound)));
    }
}

#[cfg(test)]
mod webhook_tests {
    use hmac::{Hmac, Mac};
    use rust_decimal::Decimal;
    use serde_json::json;
    use sha2::Sha256;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::payments::{PaymentRecord, PaymentStatus};
    use crate::store::BillingStore;
    use crate::webhooks::{WebhookDisposition, WebhookHeaders};

    async fn seed_pending_payment(h: &Harness, gateway_payment_id: &str) -> Uuid {
        let user = Uuid::new_v4();
        let mut record = PaymentRecord::new(user, Decimal::new(995, 2), PaymentStatus::Pending);
        record.gateway_payment_id = Some(gateway_payment_id.to_string());
        h.store.record_payment(&record).await.unwrap();
        user
    }

    // =========================================================================
    // Payment notification updates the ledger, redelivery is a no-op
    // =========================================================================
    #[tokio::test]
    async fn test_payment_notification_is_processed_once() {
        let h = harness(ScriptedGateway::approving());
        let user = seed_pending_payment(&h, "5001").await;
        let body = br#"{"id": 900, "type": "payment", "action": "payment.updated", "data": {"id": "5001"}}"#;

        let first = h
            .billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap();
        assert_eq!(first, WebhookDisposition::Processed);
        assert_eq!(
            h.store.list_payments(user).await.unwrap()[0].status,
            PaymentStatus::Approved
        );

        let second = h
            .billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap();
        assert_eq!(second, WebhookDisposition::Duplicate);
        assert_eq!(h.gateway.calls().len(), 1);
    }

    // =========================================================================
    // Webhooks never touch the subscription record
    // =========================================================================
    #[tokio::test]
    async fn test_payment_notification_does_not_activate() {
        let h = harness(ScriptedGateway::approving());
        let user = seed_pending_payment(&h, "5001").await;
        h.billing.orchestrator.subscription_status(user).await.unwrap();

        let body = br#"{"type": "payment", "data": {"id": "5001"}}"#;
        h.billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap();

        let sub = h.store.get_subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.status, crate::subscriptions::SubscriptionStatus::Trial);
    }

    // =========================================================================
    // Failed lookup is recorded as error and can be retried
    // =========================================================================
    #[tokio::test]
    async fn test_failed_lookup_can_be_redelivered() {
        let mut gateway = ScriptedGateway::approving();
        gateway.lookup = reply(404, json!({"message": "not found"}));
        let h = harness(gateway);
        let body = br#"{"id": 901, "type": "payment", "data": {"id": "404"}}"#;

        let err = h
            .billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway(_)));

        let _ = h.billing.webhooks.handle(body, WebhookHeaders::default()).await;
        assert_eq!(h.gateway.calls().len(), 2);
    }

    // =========================================================================
    // Unhandled topics are acknowledged without gateway calls
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_topic_acknowledged() {
        let h = harness(ScriptedGateway::approving());
        let body = br#"{"type": "plan", "data": {"id": "p1"}}"#;
        let disposition = h
            .billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Processed);
        assert!(h.gateway.calls().is_empty());
    }

    // =========================================================================
    // With a secret configured, unsigned deliveries are refused
    // =========================================================================
    #[tokio::test]
    async fn test_signature_enforced_when_secret_set() {
        let h = harness_with(ScriptedGateway::approving(), Some("whsec"));
        let body = br#"{"id": 902, "type": "payment", "data": {"id": "5001"}}"#;

        let err = h
            .billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(h.gateway.calls().is_empty());

        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let manifest = format!("id:5001;request-id:req-9;ts:{};", ts);
        let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec").unwrap();
        mac.update(manifest.as_bytes());
        let header = format!("ts={},v1={}", ts, hex::encode(mac.finalize().into_bytes()));

        let disposition = h
            .billing
            .webhooks
            .handle(
                body,
                WebhookHeaders {
                    signature: Some(&header),
                    request_id: Some("req-9"),
                },
            )
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Processed);
    }

    // =========================================================================
    // Preapproval notifications fetch the recurring charge
    // =========================================================================
    #[tokio::test]
    async fn test_preapproval_notification() {
        let h = harness(ScriptedGateway::approving());
        let body = br#"{"type": "subscription_preapproval", "action": "updated", "data": {"id": "pre-5001"}}"#;
        h.billing
            .webhooks
            .handle(body, WebhookHeaders::default())
            .await
            .unwrap();

        assert!(matches!(
            h.gateway.calls().as_slice(),
            [GatewayCall::GetRecurring(id)] if id == "pre-5001"
        ));
    }
}
