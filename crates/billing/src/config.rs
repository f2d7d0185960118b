//! Billing configuration

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.mercadopago.com";
const DEFAULT_PLAN_ID: &str = "monthly_19_90";
const DEFAULT_CURRENCY: &str = "BRL";
const DEFAULT_TRIAL_DAYS: i64 = 30;

/// The single priced plan offered to photographers
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub id: String,
    pub price: Decimal,
    pub currency: String,
    pub description: String,
}

impl Plan {
    /// Monthly plan at R$ 19.90
    pub fn monthly() -> Self {
        Self {
            id: DEFAULT_PLAN_ID.to_string(),
            price: Decimal::new(1990, 2),
            currency: DEFAULT_CURRENCY.to_string(),
            description: "Fotiva - Monthly Subscription".to_string(),
        }
    }
}

/// Settings for the Mercado Pago gateway client
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub access_token: String,
    pub api_base: String,
    /// Secret used to verify `x-signature` on notifications; `None` disables verification
    pub webhook_secret: Option<String>,
    /// Where the gateway posts payment notifications
    pub notification_url: String,
    /// Where the payer returns after authorizing a recurring charge
    pub back_url: String,
}

impl GatewayConfig {
    pub fn new(access_token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_base: api_base.into(),
            webhook_secret: None,
            notification_url: "http://localhost:8000/api/payments/webhook".to_string(),
            back_url: "http://localhost:3000/subscription/success".to_string(),
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }
}

/// Billing service configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: GatewayConfig,
    pub plan: Plan,
    pub trial_days: i64,
}

impl BillingConfig {
    pub fn new(gateway: GatewayConfig) -> Self {
        Self {
            gateway,
            plan: Plan::monthly(),
            trial_days: DEFAULT_TRIAL_DAYS,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let access_token = std::env::var("MERCADOPAGO_ACCESS_TOKEN")
            .map_err(|_| BillingError::Config("MERCADOPAGO_ACCESS_TOKEN not set".to_string()))?;
        let api_base =
            std::env::var("MERCADOPAGO_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let backend_url =
            std::env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
        let frontend_url =
            std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let gateway = GatewayConfig {
            access_token,
            api_base,
            webhook_secret: std::env::var("MERCADOPAGO_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            notification_url: format!(
                "{}/api/payments/webhook",
                backend_url.trim_end_matches('/')
            ),
            back_url: format!("{}/subscription/success", frontend_url.trim_end_matches('/')),
        };

        let mut plan = Plan::monthly();
        if let Ok(id) = std::env::var("PLAN_ID") {
            plan.id = id;
        }
        if let Ok(price) = std::env::var("PLAN_PRICE") {
            plan.price = Decimal::from_str(&price)
                .map_err(|e| BillingError::Config(format!("PLAN_PRICE invalid: {}", e)))?;
        }
        if let Ok(currency) = std::env::var("PLAN_CURRENCY") {
            plan.currency = currency;
        }

        let trial_days = match std::env::var("TRIAL_DAYS") {
            Ok(days) => days
                .parse()
                .map_err(|e| BillingError::Config(format!("TRIAL_DAYS invalid: {}", e)))?,
            Err(_) => DEFAULT_TRIAL_DAYS,
        };

        Ok(Self {
            gateway,
            plan,
            trial_days,
        })
    }
}
