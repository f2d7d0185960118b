//! Payment gateway webhook

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use fotiva_billing::{BillingError, WebhookDisposition, WebhookHeaders};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Gateway notification intake
///
/// Always answers 200 so the gateway does not retry; failures are logged.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<WebhookAck> {
    let webhook_headers = WebhookHeaders {
        signature: headers.get("x-signature").and_then(|v| v.to_str().ok()),
        request_id: headers.get("x-request-id").and_then(|v| v.to_str().ok()),
    };

    match state.billing.webhooks.handle(&body, webhook_headers).await {
        Ok(disposition) => Json(WebhookAck {
            success: true,
            duplicate: (disposition == WebhookDisposition::Duplicate).then_some(true),
            error: None,
        }),
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed");
            Json(WebhookAck {
                success: false,
                duplicate: None,
                error: Some(public_message(&e)),
            })
        }
    }
}

fn public_message(e: &BillingError) -> String {
    match e {
        BillingError::WebhookSignatureInvalid | BillingError::WebhookPayload(_) => e.to_string(),
        _ => "webhook processing failed".to_string(),
    }
}
