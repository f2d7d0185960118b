//! Coupon ledger
//!
//! Owns coupon definitions and the append-only redemption log. A coupon can
//! be redeemed at most once per user and never beyond its `max_uses` cap;
//! both rules are enforced again atomically by the store on redemption.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::discount::{Discount, DiscountKind};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Why a coupon cannot be used, in the order the checks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejection {
    NotFound,
    Inactive,
    NotYetValid,
    Expired,
    Exhausted,
    AlreadyUsed,
}

impl CouponRejection {
    /// Stable machine-readable reason
    pub fn code(&self) -> &'static str {
        match self {
            CouponRejection::NotFound => "not_found",
            CouponRejection::Inactive => "inactive",
            CouponRejection::NotYetValid => "not_yet_valid",
            CouponRejection::Expired => "expired",
            CouponRejection::Exhausted => "exhausted",
            CouponRejection::AlreadyUsed => "already_used",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CouponRejection::NotFound => "Coupon not found",
            CouponRejection::Inactive => "Coupon is inactive",
            CouponRejection::NotYetValid => "Coupon is not valid yet",
            CouponRejection::Expired => "Coupon expired",
            CouponRejection::Exhausted => "Coupon exhausted",
            CouponRejection::AlreadyUsed => "You have already used this coupon",
        }
    }
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A discount coupon, keyed by its upper-case code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub discount_type: DiscountKind,
    pub discount_value: Decimal,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
    pub is_active: bool,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Coupon {
    pub fn discount(&self) -> Discount {
        Discount::from_parts(self.discount_type, self.discount_value)
    }

    /// Whether the usage cap has been reached
    pub fn is_exhausted(&self) -> bool {
        self.max_uses
            .is_some_and(|max_uses| self.current_uses >= max_uses)
    }

    /// Coupon-level checks: active flag, validity window, usage cap
    ///
    /// Per-user usage is checked separately against the redemption log.
    pub fn check_availability(&self, now: OffsetDateTime) -> Result<(), CouponRejection> {
        if !self.is_active {
            return Err(CouponRejection::Inactive);
        }
        if now < self.valid_from {
            return Err(CouponRejection::NotYetValid);
        }
        if self.valid_until.is_some_and(|until| now > until) {
            return Err(CouponRejection::Expired);
        }
        if self.is_exhausted() {
            return Err(CouponRejection::Exhausted);
        }
        Ok(())
    }
}

/// One successful redemption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponUsage {
    pub id: Uuid,
    pub coupon_code: String,
    pub user_id: Uuid,
    /// Resolved currency amount, never the raw percentage
    pub discount_applied: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
}

/// Parameters for creating a coupon
#[derive(Debug, Clone)]
pub struct NewCoupon {
    pub code: String,
    pub discount_type: DiscountKind,
    pub discount_value: Decimal,
    pub created_by: Uuid,
    pub max_uses: Option<i32>,
    /// Defaults to creation time
    pub valid_from: Option<OffsetDateTime>,
    pub valid_until: Option<OffsetDateTime>,
}

/// A coupon that passed validation for a given user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidCoupon {
    pub code: String,
    pub discount_type: DiscountKind,
    pub discount_value: Decimal,
}

impl ValidCoupon {
    pub fn discount(&self) -> Discount {
        Discount::from_parts(self.discount_type, self.discount_value)
    }
}

/// Outcome of validating a coupon for a user
#[derive(Debug, Clone, PartialEq)]
pub enum CouponValidation {
    Valid(ValidCoupon),
    Invalid(CouponRejection),
}

impl CouponValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, CouponValidation::Valid(_))
    }
}

/// Coupon codes are case-insensitive and stored upper-case
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Coupon ledger service
#[derive(Clone)]
pub struct CouponLedger {
    store: Arc<dyn BillingStore>,
}

impl CouponLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Create a coupon; existing codes are never overwritten
    pub async fn create(&self, params: NewCoupon) -> BillingResult<Coupon> {
        let code = normalize_code(&params.code);
        if code.is_empty() {
            return Err(BillingError::InvalidInput(
                "coupon code must not be empty".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let coupon = Coupon {
            code: code.clone(),
            discount_type: params.discount_type,
            discount_value: params.discount_value,
            max_uses: params.max_uses,
            current_uses: 0,
            valid_from: params.valid_from.unwrap_or(now),
            valid_until: params.valid_until,
            is_active: true,
            created_by: params.created_by,
            created_at: now,
        };

        if !self.store.insert_coupon(&coupon).await? {
            return Err(BillingError::CouponExists(code));
        }

        tracing::info!(
            coupon_code = %coupon.code,
            discount_type = %coupon.discount_type,
            discount_value = %coupon.discount_value,
            max_uses = ?coupon.max_uses,
            created_by = %coupon.created_by,
            "Coupon created"
        );

        Ok(coupon)
    }

    /// Validate a coupon for a user without consuming it
    ///
    /// Checks run in order and stop at the first failure: existence, active
    /// flag, start of window, end of window, usage cap, prior use by this user.
    pub async fn validate(&self, code: &str, user_id: Uuid) -> BillingResult<CouponValidation> {
        let code = normalize_code(code);
        let now = OffsetDateTime::now_utc();

        let Some(coupon) = self.store.get_coupon(&code).await? else {
            return Ok(CouponValidation::Invalid(CouponRejection::NotFound));
        };

        if let Err(rejection) = coupon.check_availability(now) {
            return Ok(CouponValidation::Invalid(rejection));
        }

        if self.store.has_coupon_usage(&code, user_id).await? {
            return Ok(CouponValidation::Invalid(CouponRejection::AlreadyUsed));
        }

        Ok(CouponValidation::Valid(ValidCoupon {
            code: coupon.code,
            discount_type: coupon.discount_type,
            discount_value: coupon.discount_value,
        }))
    }

    /// Record a redemption: bump `current_uses` and append a usage row
    ///
    /// The store performs this as one conditional update, so a racing
    /// redemption past the cap or a second one for the same user fails
    /// with `CouponRejected` instead of overcounting.
    pub async fn redeem(
        &self,
        code: &str,
        user_id: Uuid,
        discount_applied: Decimal,
    ) -> BillingResult<CouponUsage> {
        let usage = CouponUsage {
            id: Uuid::new_v4(),
            coupon_code: normalize_code(code),
            user_id,
            discount_applied,
            used_at: OffsetDateTime::now_utc(),
        };

        self.store.redeem_coupon(&usage).await?;

        tracing::info!(
            coupon_code = %usage.coupon_code,
            user_id = %user_id,
            discount_applied = %discount_applied,
            "Coupon redeemed"
        );

        Ok(usage)
    }

    /// Turn a coupon off; deactivating an inactive coupon succeeds
    pub async fn deactivate(&self, code: &str) -> BillingResult<Coupon> {
        let code = normalize_code(code);
        let coupon = self
            .store
            .set_coupon_active(&code, false)
            .await?
            .ok_or_else(|| BillingError::CouponNotFound(code.clone()))?;

        tracing::info!(coupon_code = %code, "Coupon deactivated");
        Ok(coupon)
    }

    pub async fn get(&self, code: &str) -> BillingResult<Option<Coupon>> {
        self.store.get_coupon(&normalize_code(code)).await
    }

    pub async fn list(&self) -> BillingResult<Vec<Coupon>> {
        self.store.list_coupons().await
    }
}
