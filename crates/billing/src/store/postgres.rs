//! Postgres store

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, WebhookOutcome, WEBHOOK_PROCESSING_TIMEOUT_MINUTES};
use crate::coupons::{Coupon, CouponRejection, CouponUsage};
use crate::error::{BillingError, BillingResult};
use crate::payments::{PaymentRecord, PaymentStatus};
use crate::subscriptions::Subscription;

const SUBSCRIPTION_COLUMNS: &str = "user_id, plan_id, status, trial_start, trial_end, \
     subscription_start, subscription_end, gateway_subscription_id, auto_renew, \
     cancelled_at, cancellation_reason, created_at, updated_at";

const COUPON_COLUMNS: &str = "code, discount_type, discount_value, max_uses, current_uses, \
     valid_from, valid_until, is_active, created_by, created_at";

const PAYMENT_COLUMNS: &str = "id, user_id, amount, status, payment_method, gateway_payment_id, \
     coupon_code, discount_applied, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    plan_id: String,
    status: String,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    subscription_start: Option<OffsetDateTime>,
    subscription_end: Option<OffsetDateTime>,
    gateway_subscription_id: Option<String>,
    auto_renew: bool,
    cancelled_at: Option<OffsetDateTime>,
    cancellation_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse().map_err(BillingError::Database)?,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            subscription_start: row.subscription_start,
            subscription_end: row.subscription_end,
            gateway_subscription_id: row.gateway_subscription_id,
            auto_renew: row.auto_renew,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CouponRow {
    code: String,
    discount_type: String,
    discount_value: Decimal,
    max_uses: Option<i32>,
    current_uses: i32,
    valid_from: OffsetDateTime,
    valid_until: Option<OffsetDateTime>,
    is_active: bool,
    created_by: Uuid,
    created_at: OffsetDateTime,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = BillingError;

    fn try_from(row: CouponRow) -> Result<Self, Self::Error> {
        Ok(Coupon {
            code: row.code,
            discount_type: row.discount_type.parse().map_err(BillingError::Database)?,
            discount_value: row.discount_value,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            is_active: row.is_active,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CouponUsageRow {
    id: Uuid,
    coupon_code: String,
    user_id: Uuid,
    discount_applied: Decimal,
    used_at: OffsetDateTime,
}

impl From<CouponUsageRow> for CouponUsage {
    fn from(row: CouponUsageRow) -> Self {
        CouponUsage {
            id: row.id,
            coupon_code: row.coupon_code,
            user_id: row.user_id,
            discount_applied: row.discount_applied,
            used_at: row.used_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    status: String,
    payment_method: Option<String>,
    gateway_payment_id: Option<String>,
    coupon_code: Option<String>,
    discount_applied: Decimal,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<PaymentRow> for PaymentRecord {
    fn from(row: PaymentRow) -> Self {
        PaymentRecord {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            status: PaymentStatus::from_gateway(&row.status),
            payment_method: row.payment_method,
            gateway_payment_id: row.gateway_payment_id,
            coupon_code: row.coupon_code,
            discount_applied: row.discount_applied,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Store backed by the tables in `migrations/`
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn bind_subscription<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        sub: &'q Subscription,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        query
            .bind(sub.user_id)
            .bind(&sub.plan_id)
            .bind(sub.status.as_str())
            .bind(sub.trial_start)
            .bind(sub.trial_end)
            .bind(sub.subscription_start)
            .bind(sub.subscription_end)
            .bind(&sub.gateway_subscription_id)
            .bind(sub.auto_renew)
            .bind(sub.cancelled_at)
            .bind(&sub.cancellation_reason)
            .bind(sub.created_at)
            .bind(sub.updated_at)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<bool> {
        let sql = format!(
            "INSERT INTO subscriptions ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (user_id) DO NOTHING",
            SUBSCRIPTION_COLUMNS
        );
        let result = Self::bind_subscription(sqlx::query(&sql), subscription)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let sql = format!(
            "INSERT INTO subscriptions ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 plan_id = EXCLUDED.plan_id, \
                 status = EXCLUDED.status, \
                 subscription_start = EXCLUDED.subscription_start, \
                 subscription_end = EXCLUDED.subscription_end, \
                 gateway_subscription_id = EXCLUDED.gateway_subscription_id, \
                 auto_renew = EXCLUDED.auto_renew, \
                 cancelled_at = EXCLUDED.cancelled_at, \
                 cancellation_reason = EXCLUDED.cancellation_reason, \
                 updated_at = EXCLUDED.updated_at",
            SUBSCRIPTION_COLUMNS
        );
        Self::bind_subscription(sqlx::query(&sql), subscription)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> =
            sqlx::query_as(&format!("SELECT {} FROM subscriptions", SUBSCRIPTION_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> BillingResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO coupons ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (code) DO NOTHING",
            COUPON_COLUMNS
        ))
        .bind(&coupon.code)
        .bind(coupon.discount_type.as_str())
        .bind(coupon.discount_value)
        .bind(coupon.max_uses)
        .bind(coupon.current_uses)
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(coupon.is_active)
        .bind(coupon.created_by)
        .bind(coupon.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> = sqlx::query_as(&format!(
            "SELECT {} FROM coupons WHERE code = $1",
            COUPON_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Coupon::try_from).transpose()
    }

    async fn list_coupons(&self) -> BillingResult<Vec<Coupon>> {
        let rows: Vec<CouponRow> = sqlx::query_as(&format!(
            "SELECT {} FROM coupons ORDER BY created_at DESC",
            COUPON_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Coupon::try_from).collect()
    }

    async fn set_coupon_active(&self, code: &str, active: bool) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> = sqlx::query_as(&format!(
            "UPDATE coupons SET is_active = $2 WHERE code = $1 RETURNING {}",
            COUPON_COLUMNS
        ))
        .bind(code)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Coupon::try_from).transpose()
    }

    async fn has_coupon_usage(&self, code: &str, user_id: Uuid) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM coupon_usages WHERE coupon_code = $1 AND user_id = $2)",
        )
        .bind(code)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }

    async fn redeem_coupon(&self, usage: &CouponUsage) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // Compare-and-increment: only succeeds while under the cap
        let bumped = sqlx::query(
            r#"
            UPDATE coupons
            SET current_uses = current_uses + 1
            WHERE code = $1
              AND (max_uses IS NULL OR current_uses < max_uses)
            "#,
        )
        .bind(&usage.coupon_code)
        .execute(&mut *tx)
        .await?;

        if bumped.rows_affected() == 0 {
            let exists: (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM coupons WHERE code = $1)")
                    .bind(&usage.coupon_code)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;

            let rejection = if exists.0 {
                CouponRejection::Exhausted
            } else {
                CouponRejection::NotFound
            };
            return Err(BillingError::CouponRejected(rejection));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO coupon_usages (id, coupon_code, user_id, discount_applied, used_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (coupon_code, user_id) DO NOTHING
            "#,
        )
        .bind(usage.id)
        .bind(&usage.coupon_code)
        .bind(usage.user_id)
        .bind(usage.discount_applied)
        .bind(usage.used_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(BillingError::CouponRejected(CouponRejection::AlreadyUsed));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_coupon_usages(&self) -> BillingResult<Vec<CouponUsage>> {
        let rows: Vec<CouponUsageRow> = sqlx::query_as(
            "SELECT id, coupon_code, user_id, discount_applied, used_at FROM coupon_usages",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CouponUsage::from).collect())
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO payments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            PAYMENT_COLUMNS
        ))
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(&payment.payment_method)
        .bind(&payment.gateway_payment_id)
        .bind(&payment.coupon_code)
        .bind(payment.discount_applied)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_payment_status(
        &self,
        gateway_payment_id: &str,
        status: PaymentStatus,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "UPDATE payments SET status = $2, updated_at = NOW() \
             WHERE gateway_payment_id = $1 RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(gateway_payment_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PaymentRecord::from))
    }

    async fn list_payments(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE user_id = $1 ORDER BY created_at DESC",
            PAYMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentRecord::from).collect())
    }

    async fn claim_webhook_event(&self, event_key: &str, event_type: &str) -> BillingResult<bool> {
        // Only one caller gets a row back. Errored events and events stuck in
        // processing past the timeout can be reclaimed by a redelivery.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (id, event_key, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_key) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE gateway_webhook_events.processing_result = 'error'
               OR (gateway_webhook_events.processing_result = 'processing'
                   AND gateway_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_key)
        .bind(event_type)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_key: &str,
        outcome: WebhookOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $2, error_message = $3
            WHERE event_key = $1
            "#,
        )
        .bind(event_key)
        .bind(outcome.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
