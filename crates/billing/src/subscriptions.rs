//! Subscription state
//!
//! One subscription record per user. Records are provisioned as a trial on
//! first lookup, activated by successful payments and flagged cancelled on
//! cancellation; they are never deleted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Plan id recorded on trial subscriptions
pub const TRIAL_PLAN_ID: &str = "trial";

/// Length of one paid month
pub const DAYS_PER_MONTH: i64 = 30;

/// End of a paid period of `months` months starting at `start`
///
/// Month counts too large to represent as a date are rejected.
pub fn period_end(start: OffsetDateTime, months: u32) -> BillingResult<OffsetDateTime> {
    i64::from(months)
        .checked_mul(DAYS_PER_MONTH * 86_400)
        .and_then(|seconds| start.checked_add(Duration::seconds(seconds)))
        .ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "subscription period of {} months is out of range",
                months
            ))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

/// A user's subscription record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_end: Option<OffsetDateTime>,
    pub gateway_subscription_id: Option<String>,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Fresh trial starting at `now`
    pub fn new_trial(user_id: Uuid, now: OffsetDateTime, trial_days: i64) -> Self {
        Self {
            user_id,
            plan_id: TRIAL_PLAN_ID.to_string(),
            status: SubscriptionStatus::Trial,
            trial_start: Some(now),
            trial_end: Some(now + Duration::days(trial_days)),
            subscription_start: None,
            subscription_end: None,
            gateway_subscription_id: None,
            auto_renew: true,
            cancelled_at: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the user has access at `now`
    ///
    /// An active record without an end date is treated as non-expiring.
    /// Cancelled and past-due records never grant access.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        match self.status {
            SubscriptionStatus::Trial => self.trial_end.is_some_and(|end| now < end),
            SubscriptionStatus::Active => self.subscription_end.map_or(true, |end| now < end),
            SubscriptionStatus::Cancelled | SubscriptionStatus::PastDue => false,
        }
    }

    /// Whole days left in the current trial or paid period, floored at zero
    ///
    /// `None` when no countdown applies (cancelled, past due, or an active
    /// record without an end date).
    pub fn days_remaining_at(&self, now: OffsetDateTime) -> Option<i64> {
        let end = match self.status {
            SubscriptionStatus::Trial => self.trial_end?,
            SubscriptionStatus::Active => self.subscription_end?,
            SubscriptionStatus::Cancelled | SubscriptionStatus::PastDue => return None,
        };
        Some((end - now).whole_days().max(0))
    }
}

/// Subscription state store
#[derive(Clone)]
pub struct SubscriptionStore {
    store: Arc<dyn BillingStore>,
    trial_days: i64,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn BillingStore>, trial_days: i64) -> Self {
        Self { store, trial_days }
    }

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.store.get_subscription(user_id).await
    }

    pub async fn create_trial(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.create_trial_at(user_id, OffsetDateTime::now_utc()).await
    }

    /// Provision a trial for a user without a record
    ///
    /// If a concurrent request provisioned the record first, that record
    /// is returned unchanged.
    pub async fn create_trial_at(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let trial = Subscription::new_trial(user_id, now, self.trial_days);

        if self.store.insert_subscription(&trial).await? {
            tracing::info!(
                user_id = %user_id,
                trial_end = ?trial.trial_end,
                "Trial subscription provisioned"
            );
            return Ok(trial);
        }

        tracing::debug!(user_id = %user_id, "Trial already provisioned by another request");
        self.store
            .get_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("subscription for {} vanished", user_id)))
    }

    pub async fn is_active(&self, user_id: Uuid) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .get(user_id)
            .await?
            .is_some_and(|sub| sub.is_active_at(now)))
    }

    pub async fn days_remaining(&self, user_id: Uuid) -> BillingResult<Option<i64>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .get(user_id)
            .await?
            .and_then(|sub| sub.days_remaining_at(now)))
    }

    /// Mark a subscription as paid for `months` months starting now
    ///
    /// The period is measured from the moment of payment, never appended to
    /// time left on a previous period. Creates the record if missing.
    pub async fn activate(
        &self,
        user_id: Uuid,
        plan_id: &str,
        gateway_subscription_id: &str,
        months: u32,
    ) -> BillingResult<Subscription> {
        if months == 0 {
            return Err(BillingError::InvalidInput(
                "activation requires at least one month".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let subscription_end = period_end(now, months)?;
        let mut subscription = match self.get(user_id).await? {
            Some(existing) => existing,
            None => {
                tracing::warn!(user_id = %user_id, "Activating user without a trial record");
                Subscription::new_trial(user_id, now, self.trial_days)
            }
        };

        subscription.plan_id = plan_id.to_string();
        subscription.status = SubscriptionStatus::Active;
        subscription.subscription_start = Some(now);
        subscription.subscription_end = Some(subscription_end);
        subscription.gateway_subscription_id = Some(gateway_subscription_id.to_string());
        subscription.auto_renew = true;
        subscription.updated_at = now;

        self.store.save_subscription(&subscription).await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            gateway_subscription_id = %gateway_subscription_id,
            months = months,
            subscription_end = ?subscription.subscription_end,
            "Subscription activated"
        );

        Ok(subscription)
    }

    /// Flag a subscription cancelled; `None` when the user has no record
    ///
    /// The paid period boundaries are kept as they are.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<Option<Subscription>> {
        let Some(mut subscription) = self.get(user_id).await? else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.cancelled_at = Some(now);
        subscription.cancellation_reason = reason;
        subscription.auto_renew = false;
        subscription.updated_at = now;

        self.store.save_subscription(&subscription).await?;

        tracing::info!(
            user_id = %user_id,
            reason = ?subscription.cancellation_reason,
            "Subscription cancelled"
        );

        Ok(Some(subscription))
    }
}
