//! Subscription routes

use axum::{extract::State, Extension, Json};
use fotiva_billing::{CreateOutcome, CreateSubscription, Subscription, SubscriptionOverview};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    #[serde(default)]
    pub plan_id: Option<String>,
    pub payment_method_id: String,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSubscriptionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    pub payment_id: Option<String>,
    pub message: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSubscriptionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelSubscriptionResponse {
    pub success: bool,
    pub message: &'static str,
    pub subscription: Subscription,
}

/// Current subscription; a trial is provisioned on the first call
pub async fn get_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionOverview>> {
    let overview = state
        .billing
        .orchestrator
        .subscription_status(auth_user.user_id)
        .await?;

    Ok(Json(overview))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<CreateSubscriptionResponse>> {
    let outcome = state
        .billing
        .orchestrator
        .create_subscription(CreateSubscription {
            user_id: auth_user.user_id,
            email: auth_user.email,
            plan_id: body.plan_id,
            payment_method_id: body.payment_method_id,
            coupon_code: body.coupon_code.filter(|code| !code.trim().is_empty()),
        })
        .await?;

    let response = match outcome {
        CreateOutcome::Activated {
            subscription,
            payment_id,
        } => CreateSubscriptionResponse {
            success: true,
            subscription: Some(subscription),
            payment_status: None,
            payment_id,
            message: "Subscription activated",
        },
        CreateOutcome::Pending {
            payment_status,
            payment_id,
        } => CreateSubscriptionResponse {
            success: false,
            subscription: None,
            payment_status: Some(payment_status),
            payment_id,
            message: "Waiting for payment approval",
        },
    };

    Ok(Json(response))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<CancelSubscriptionRequest>>,
) -> ApiResult<Json<CancelSubscriptionResponse>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let subscription = state
        .billing
        .orchestrator
        .cancel_subscription(auth_user.user_id, body.reason)
        .await?;

    Ok(Json(CancelSubscriptionResponse {
        success: true,
        message: "Subscription cancelled",
        subscription,
    }))
}
