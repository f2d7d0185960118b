//! Mercado Pago REST client (no SDK dependency)

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use super::{GatewayResponse, PaymentGateway, PaymentRequest, RecurringChargeRequest};
use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct MercadoPagoClient {
    http: Client,
    config: GatewayConfig,
}

impl MercadoPagoClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> BillingResult<GatewayResponse> {
        let response = request
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(operation = %operation, error = %e, "Mercado Pago request failed");
                BillingError::from(e)
            })?;

        let status_code = response.status().as_u16();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);

        if (200..300).contains(&status_code) {
            tracing::debug!(operation = %operation, status_code, "Mercado Pago call succeeded");
        } else {
            tracing::warn!(
                operation = %operation,
                status_code,
                body = %text,
                "Mercado Pago call returned an error status"
            );
        }

        Ok(GatewayResponse { status_code, body })
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<GatewayResponse> {
        let payload = json!({
            "transaction_amount": request.amount,
            "description": request.description,
            "payment_method_id": request.payment_method_id,
            "installments": 1,
            "payer": { "email": request.payer_email },
            "notification_url": self.config.notification_url,
        });

        let builder = self
            .http
            .post(self.url("/v1/payments"))
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .json(&payload);
        self.send(builder, "create_payment").await
    }

    async fn create_recurring_charge(
        &self,
        request: &RecurringChargeRequest,
    ) -> BillingResult<GatewayResponse> {
        let start_date = request
            .start_date
            .format(&Rfc3339)
            .map_err(|e| BillingError::Internal(format!("start date format: {}", e)))?;

        let mut payload = json!({
            "reason": request.description,
            "auto_recurring": {
                "frequency": 1,
                "frequency_type": "months",
                "transaction_amount": request.base_price,
                "currency_id": request.currency,
                "start_date": start_date,
            },
            "back_url": self.config.back_url,
            "payer_email": request.payer_email,
            "payment_method_id": request.payment_method_id,
        });
        if let Some(payer_id) = &request.payer_id {
            payload["external_reference"] = json!(payer_id);
        }

        let builder = self.http.post(self.url("/preapproval")).json(&payload);
        self.send(builder, "create_recurring_charge").await
    }

    async fn cancel_recurring_charge(&self, id: &str) -> BillingResult<GatewayResponse> {
        let builder = self
            .http
            .put(self.url(&format!("/preapproval/{}", id)))
            .json(&json!({ "status": "cancelled" }));
        self.send(builder, "cancel_recurring_charge").await
    }

    async fn get_recurring_charge(&self, id: &str) -> BillingResult<GatewayResponse> {
        let builder = self.http.get(self.url(&format!("/preapproval/{}", id)));
        self.send(builder, "get_recurring_charge").await
    }

    async fn get_payment(&self, id: &str) -> BillingResult<GatewayResponse> {
        let builder = self.http.get(self.url(&format!("/v1/payments/{}", id)));
        self.send(builder, "get_payment").await
    }
}
