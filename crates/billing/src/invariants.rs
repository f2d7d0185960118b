//! Billing invariants
//!
//! Read-only consistency checks over a snapshot of the billing tables. The
//! worker runs them on a schedule; they can also be run after a manual
//! data fix to confirm nothing was broken.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::coupons::{normalize_code, Coupon, CouponUsage};
use crate::error::BillingResult;
use crate::store::BillingStore;
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// One invariant that does not hold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub coupon_codes: Vec<String>,
    pub description: String,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may be charged or discounted incorrectly
    Critical,
    High,
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Everything the checks look at, read once
#[derive(Debug, Clone, Default)]
pub struct BillingSnapshot {
    pub subscriptions: Vec<Subscription>,
    pub coupons: Vec<Coupon>,
    pub usages: Vec<CouponUsage>,
}

type Check = fn(&BillingSnapshot) -> Vec<InvariantViolation>;

const CHECKS: &[(&str, Check)] = &[
    ("coupon_uses_within_cap", check_coupon_uses_within_cap),
    ("coupon_usage_unique_per_user", check_coupon_usage_unique_per_user),
    ("coupon_usage_count_matches", check_coupon_usage_count_matches),
    ("coupon_code_normalized", check_coupon_code_normalized),
    ("trial_shape", check_trial_shape),
    ("active_period_valid", check_active_period_valid),
    ("cancelled_has_timestamp", check_cancelled_has_timestamp),
];

pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    async fn snapshot(&self) -> BillingResult<BillingSnapshot> {
        Ok(BillingSnapshot {
            subscriptions: self.store.list_subscriptions().await?,
            coupons: self.store.list_coupons().await?,
            usages: self.store.list_coupon_usages().await?,
        })
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let snapshot = self.snapshot().await?;
        Ok(summarize(&snapshot))
    }

    /// Run one check by name; unknown names find nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let Some((_, check)) = CHECKS.iter().find(|(check_name, _)| *check_name == name) else {
            return Ok(vec![]);
        };
        let snapshot = self.snapshot().await?;
        Ok(check(&snapshot))
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }
}

/// Run every check against a snapshot
pub fn summarize(snapshot: &BillingSnapshot) -> InvariantCheckSummary {
    let violations: Vec<InvariantViolation> = CHECKS
        .iter()
        .flat_map(|(_, check)| check(snapshot))
        .collect();

    let checks_run = CHECKS.len();
    let checks_failed = violations
        .iter()
        .map(|v| v.invariant.as_str())
        .collect::<HashSet<_>>()
        .len();

    InvariantCheckSummary {
        checked_at: OffsetDateTime::now_utc(),
        checks_run,
        checks_passed: checks_run - checks_failed,
        checks_failed,
        healthy: violations.is_empty(),
        violations,
    }
}

fn coupon_violation(
    invariant: &str,
    code: &str,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: vec![],
        coupon_codes: vec![code.to_string()],
        description,
        severity,
    }
}

fn subscription_violation(
    invariant: &str,
    user_id: Uuid,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: vec![user_id],
        coupon_codes: vec![],
        description,
        severity,
    }
}

fn check_coupon_uses_within_cap(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .coupons
        .iter()
        .filter_map(|coupon| {
            let max_uses = coupon.max_uses?;
            (coupon.current_uses > max_uses).then(|| {
                coupon_violation(
                    "coupon_uses_within_cap",
                    &coupon.code,
                    format!(
                        "Coupon {} used {} times, cap is {}",
                        coupon.code, coupon.current_uses, max_uses
                    ),
                    ViolationSeverity::Critical,
                )
            })
        })
        .collect()
}

fn check_coupon_usage_unique_per_user(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    let mut counts: HashMap<(&str, Uuid), usize> = HashMap::new();
    for usage in &snapshot.usages {
        *counts
            .entry((usage.coupon_code.as_str(), usage.user_id))
            .or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((code, user_id), count)| InvariantViolation {
            invariant: "coupon_usage_unique_per_user".to_string(),
            user_ids: vec![user_id],
            coupon_codes: vec![code.to_string()],
            description: format!("User redeemed coupon {} {} times", code, count),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_coupon_usage_count_matches(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for usage in &snapshot.usages {
        *counts.entry(usage.coupon_code.as_str()).or_default() += 1;
    }

    snapshot
        .coupons
        .iter()
        .filter_map(|coupon| {
            let recorded = counts.get(coupon.code.as_str()).copied().unwrap_or(0);
            (i64::from(coupon.current_uses) != recorded).then(|| {
                coupon_violation(
                    "coupon_usage_count_matches",
                    &coupon.code,
                    format!(
                        "Coupon {} counts {} uses but has {} usage records",
                        coupon.code, coupon.current_uses, recorded
                    ),
                    ViolationSeverity::High,
                )
            })
        })
        .collect()
}

fn check_coupon_code_normalized(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .coupons
        .iter()
        .filter(|coupon| normalize_code(&coupon.code) != coupon.code)
        .map(|coupon| {
            coupon_violation(
                "coupon_code_normalized",
                &coupon.code,
                format!("Coupon code '{}' is not normalized", coupon.code),
                ViolationSeverity::Medium,
            )
        })
        .collect()
}

fn check_trial_shape(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|sub| sub.status == SubscriptionStatus::Trial)
        .filter(|sub| sub.trial_end.is_none() || sub.subscription_end.is_some())
        .map(|sub| {
            subscription_violation(
                "trial_shape",
                sub.user_id,
                format!(
                    "Trial has trial_end {:?} and subscription_end {:?}",
                    sub.trial_end, sub.subscription_end
                ),
                ViolationSeverity::High,
            )
        })
        .collect()
}

fn check_active_period_valid(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|sub| sub.status == SubscriptionStatus::Active)
        .filter(|sub| match (sub.subscription_start, sub.subscription_end) {
            (Some(start), Some(end)) => end <= start,
            _ => true,
        })
        .map(|sub| {
            subscription_violation(
                "active_period_valid",
                sub.user_id,
                format!(
                    "Active subscription period {:?} .. {:?} is not valid",
                    sub.subscription_start, sub.subscription_end
                ),
                ViolationSeverity::High,
            )
        })
        .collect()
}

fn check_cancelled_has_timestamp(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|sub| sub.status == SubscriptionStatus::Cancelled)
        .filter(|sub| sub.cancelled_at.is_none() || sub.auto_renew)
        .map(|sub| {
            subscription_violation(
                "cancelled_has_timestamp",
                sub.user_id,
                "Cancelled subscription lacks cancelled_at or still auto-renews".to_string(),
                ViolationSeverity::Medium,
            )
        })
        .collect()
}
