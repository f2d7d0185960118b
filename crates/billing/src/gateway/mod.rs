//! Payment gateway seam
//!
//! The orchestrator sees the gateway as five calls returning the raw HTTP
//! status and JSON body. Any non-2xx status is a failure; error bodies are
//! never interpreted beyond logging.

mod mercadopago;

pub use mercadopago::MercadoPagoClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// One-time charge for the first billing cycle
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub description: String,
    pub payer_email: String,
    pub payment_method_id: String,
}

/// Recurring charge billed monthly at the undiscounted price
#[derive(Debug, Clone)]
pub struct RecurringChargeRequest {
    pub payer_email: String,
    pub base_price: Decimal,
    pub currency: String,
    /// Payer id reported by the gateway on the first payment
    pub payer_id: Option<String>,
    pub payment_method_id: String,
    pub description: String,
    pub start_date: OffsetDateTime,
}

/// Raw gateway reply
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status_code: u16,
    pub body: Value,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// `id` field of the body as a string, whether the gateway sent a number or a string
    pub fn id(&self) -> Option<String> {
        json_id(self.body.get("id")?)
    }

    /// `status` field of the body
    pub fn status(&self) -> Option<&str> {
        self.body.get("status").and_then(Value::as_str)
    }
}

/// Read an id the gateway may encode as number or string
pub fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<GatewayResponse>;

    async fn create_recurring_charge(
        &self,
        request: &RecurringChargeRequest,
    ) -> BillingResult<GatewayResponse>;

    async fn cancel_recurring_charge(&self, id: &str) -> BillingResult<GatewayResponse>;

    async fn get_recurring_charge(&self, id: &str) -> BillingResult<GatewayResponse>;

    async fn get_payment(&self, id: &str) -> BillingResult<GatewayResponse>;
}
