//! API routes

pub mod coupons;
pub mod health;
pub mod subscription;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Build the `/api` router
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/payments/webhook", post(webhooks::payment_webhook));

    let admin_routes = Router::new()
        .route("/coupons/create", post(coupons::create_coupon))
        .route("/coupons/list", get(coupons::list_coupons))
        .route("/coupons/{code}/deactivate", post(coupons::deactivate_coupon))
        .route_layer(middleware::from_fn(require_admin));

    let protected_routes = Router::new()
        .route("/subscription/status", get(subscription::get_status))
        .route("/subscription/create", post(subscription::create_subscription))
        .route("/subscription/cancel", post(subscription::cancel_subscription))
        .route("/coupons/validate", post(coupons::validate_coupon))
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .nest("/api", public_routes.merge(protected_routes))
        .with_state(state)
}
