//! Mercado Pago webhook intake
//!
//! Verifies and parses gateway notifications, claims each one exactly once
//! and hands it to the orchestrator for reconciliation. Callers acknowledge
//! the gateway whatever the outcome, so nothing here retries.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::json_id;
use crate::orchestrator::BillingOrchestrator;
use crate::store::{BillingStore, WebhookOutcome};

/// Maximum age of a signed notification
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Notification topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationTopic {
    Payment,
    SubscriptionPreapproval,
    Other(String),
}

impl NotificationTopic {
    fn parse(raw: &str) -> Self {
        match raw {
            "payment" => NotificationTopic::Payment,
            "subscription_preapproval" | "preapproval" => NotificationTopic::SubscriptionPreapproval,
            other => NotificationTopic::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotificationTopic::Payment => "payment",
            NotificationTopic::SubscriptionPreapproval => "subscription_preapproval",
            NotificationTopic::Other(other) => other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawNotification {
    id: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<String>,
    topic: Option<String>,
    action: Option<String>,
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    id: Option<Value>,
}

/// A parsed gateway notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayNotification {
    pub id: Option<String>,
    pub topic: NotificationTopic,
    pub action: Option<String>,
    /// Id of the resource the notification is about
    pub data_id: String,
}

impl GatewayNotification {
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        let raw: RawNotification = serde_json::from_slice(body)
            .map_err(|e| BillingError::WebhookPayload(e.to_string()))?;

        let topic = raw
            .kind
            .or(raw.topic)
            .ok_or_else(|| BillingError::WebhookPayload("missing type".to_string()))?;
        let data_id = raw
            .data
            .and_then(|data| data.id)
            .as_ref()
            .and_then(json_id)
            .ok_or_else(|| BillingError::WebhookPayload("missing data.id".to_string()))?;

        Ok(Self {
            id: raw.id.as_ref().and_then(json_id),
            topic: NotificationTopic::parse(&topic),
            action: raw.action,
            data_id,
        })
    }

    /// Key under which a delivery is claimed; redeliveries share it
    pub fn idempotency_key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}",
                self.topic.as_str(),
                self.data_id,
                self.action.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Verify an `x-signature` header (`ts=<unix>,v1=<hex>`)
///
/// The signed manifest is `id:<data.id>;request-id:<x-request-id>;ts:<ts>;`.
pub fn verify_signature(
    secret: &str,
    signature_header: &str,
    request_id: &str,
    data_id: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp = "";
    let mut signature = "";
    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(ts) = part.strip_prefix("ts=") {
            timestamp = ts;
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signature = v1;
        }
    }

    if timestamp.is_empty() || signature.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    if (now.unix_timestamp() - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(ts, "Webhook signature timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let manifest = format!(
        "id:{};request-id:{};ts:{};",
        data_id.to_lowercase(),
        request_id,
        timestamp
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("invalid webhook secret".to_string()))?;
    mac.update(manifest.as_bytes());

    let expected = hex::decode(signature).map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.verify_slice(&expected)
        .map_err(|_| BillingError::WebhookSignatureInvalid)
}

/// Signature headers sent with a delivery
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookHeaders<'a> {
    pub signature: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

/// What happened to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    Processed,
    /// Already processed, or being processed elsewhere
    Duplicate,
}

/// Webhook intake service
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    orchestrator: Arc<BillingOrchestrator>,
    secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        orchestrator: Arc<BillingOrchestrator>,
        secret: Option<String>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            secret,
        }
    }

    /// Verify, claim and reconcile one delivery
    pub async fn handle(
        &self,
        body: &[u8],
        headers: WebhookHeaders<'_>,
    ) -> BillingResult<WebhookDisposition> {
        let notification = GatewayNotification::parse(body)?;

        if let Some(secret) = &self.secret {
            let signature = headers
                .signature
                .ok_or(BillingError::WebhookSignatureInvalid)?;
            verify_signature(
                secret,
                signature,
                headers.request_id.unwrap_or(""),
                &notification.data_id,
                OffsetDateTime::now_utc(),
            )?;
        }

        let key = notification.idempotency_key();
        if !self
            .store
            .claim_webhook_event(&key, notification.topic.as_str())
            .await?
        {
            tracing::info!(
                event_key = %key,
                topic = %notification.topic.as_str(),
                "Duplicate webhook delivery"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        tracing::info!(
            event_key = %key,
            topic = %notification.topic.as_str(),
            data_id = %notification.data_id,
            "Processing webhook (claimed)"
        );

        let result = self.orchestrator.reconcile_webhook(&notification).await;

        let (outcome, error_message) = match &result {
            Ok(()) => (WebhookOutcome::Success, None),
            Err(e) => (WebhookOutcome::Error, Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .finish_webhook_event(&key, outcome, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_key = %key,
                error = %e,
                "Failed to record webhook result; event may stay in processing"
            );
        }

        result.map(|()| WebhookDisposition::Processed)
    }
}
