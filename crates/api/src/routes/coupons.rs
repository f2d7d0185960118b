//! Coupon routes
//!
//! `validate` is open to any authenticated user; create, list and
//! deactivate are mounted behind the admin check.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use fotiva_billing::{Coupon, CouponQuote, DiscountKind, DiscountOutcome, NewCoupon, ValidCoupon};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateCouponRequest {
    pub code: String,
    pub discount_type: DiscountKind,
    pub discount_value: Decimal,
    #[serde(default)]
    pub max_uses: Option<i32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct CouponResponse {
    pub success: bool,
    pub coupon: Coupon,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateCouponRequest {
    pub code: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidateCouponResponse {
    pub valid: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_type: Option<DiscountKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_months: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CouponListResponse {
    pub coupons: Vec<Coupon>,
    pub total: usize,
}

pub async fn create_coupon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<CreateCouponRequest>,
) -> ApiResult<Json<CouponResponse>> {
    let coupon = state
        .billing
        .coupons
        .create(NewCoupon {
            code: body.code,
            discount_type: body.discount_type,
            discount_value: body.discount_value,
            created_by: auth_user.user_id,
            max_uses: body.max_uses,
            valid_from: body.valid_from,
            valid_until: body.valid_until,
        })
        .await?;

    Ok(Json(CouponResponse {
        success: true,
        message: format!("Coupon {} created", coupon.code),
        coupon,
    }))
}

/// Check a coupon for the caller and preview the discounted price
pub async fn validate_coupon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<ValidateCouponRequest>,
) -> ApiResult<Json<ValidateCouponResponse>> {
    let quote = state
        .billing
        .orchestrator
        .quote_coupon(&body.code, auth_user.user_id)
        .await?;

    let response = match quote {
        CouponQuote::Valid {
            coupon,
            original_price,
            outcome,
        } => ValidateCouponResponse {
            valid: true,
            message: preview_message(&coupon, original_price, &outcome),
            reason: None,
            discount_type: Some(coupon.discount_type),
            discount_value: Some(coupon.discount_value),
            original_price: Some(original_price),
            final_price: Some(outcome.final_price),
            free_months: (outcome.free_months > 0).then_some(outcome.free_months),
        },
        CouponQuote::Invalid(rejection) => ValidateCouponResponse {
            valid: false,
            message: rejection.message().to_string(),
            reason: Some(rejection.code()),
            ..Default::default()
        },
    };

    Ok(Json(response))
}

pub async fn list_coupons(State(state): State<AppState>) -> ApiResult<Json<CouponListResponse>> {
    let coupons = state.billing.coupons.list().await?;

    Ok(Json(CouponListResponse {
        total: coupons.len(),
        coupons,
    }))
}

pub async fn deactivate_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<CouponResponse>> {
    let coupon = state.billing.coupons.deactivate(&code).await?;

    Ok(Json(CouponResponse {
        success: true,
        message: format!("Coupon {} deactivated", coupon.code),
        coupon,
    }))
}

fn preview_message(coupon: &ValidCoupon, original_price: Decimal, outcome: &DiscountOutcome) -> String {
    match coupon.discount_type {
        DiscountKind::Percentage => format!(
            "{}% off applied! From R$ {:.2} to R$ {:.2}",
            coupon.discount_value.normalize(),
            original_price,
            outcome.final_price
        ),
        DiscountKind::Fixed => format!(
            "R$ {:.2} off applied! From R$ {:.2} to R$ {:.2}",
            coupon.discount_value, original_price, outcome.final_price
        ),
        DiscountKind::FreeMonths => {
            let months = outcome.free_months;
            format!(
                "{} free {}! First payment waived.",
                months,
                if months == 1 { "month" } else { "months" }
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(kind: DiscountKind, value: Decimal) -> ValidCoupon {
        ValidCoupon {
            code: "TEST".to_string(),
            discount_type: kind,
            discount_value: value,
        }
    }

    #[test]
    fn test_preview_message_percentage() {
        let outcome = DiscountOutcome {
            final_price: Decimal::new(995, 2),
            discount_amount: Decimal::new(995, 2),
            free_months: 0,
        };
        let message = preview_message(
            &valid(DiscountKind::Percentage, Decimal::new(5000, 2)),
            Decimal::new(1990, 2),
            &outcome,
        );
        assert_eq!(message, "50% off applied! From R$ 19.90 to R$ 9.95");
    }

    #[test]
    fn test_preview_message_free_months() {
        let outcome = DiscountOutcome {
            final_price: Decimal::ZERO,
            discount_amount: Decimal::new(1990, 2),
            free_months: 1,
        };
        let message = preview_message(
            &valid(DiscountKind::FreeMonths, Decimal::ONE),
            Decimal::new(1990, 2),
            &outcome,
        );
        assert_eq!(message, "1 free month! First payment waived.");
    }
}
