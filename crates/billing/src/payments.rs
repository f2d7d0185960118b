//! Payment ledger
//!
//! Every first-invoice charge submitted to the gateway is recorded here,
//! whatever the outcome. Webhook notifications later move the status along.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
    Refunded,
    Cancelled,
    InProcess,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::InProcess => "in_process",
        }
    }

    /// Map a gateway status string; anything unrecognised is still pending
    pub fn from_gateway(status: &str) -> Self {
        status.parse().unwrap_or(PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "approved" => Ok(PaymentStatus::Approved),
            "rejected" => Ok(PaymentStatus::Rejected),
            "refunded" => Ok(PaymentStatus::Refunded),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "in_process" => Ok(PaymentStatus::InProcess),
            other => Err(format!("unknown payment status '{}'", other)),
        }
    }
}

/// One charge submitted to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub coupon_code: Option<String>,
    pub discount_applied: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PaymentRecord {
    pub fn new(user_id: Uuid, amount: Decimal, status: PaymentStatus) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            status,
            payment_method: None,
            gateway_payment_id: None,
            coupon_code: None,
            discount_applied: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}
