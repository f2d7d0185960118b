//! Discount calculation
//!
//! Maps a base price and an optional coupon discount to the amount charged
//! on the first invoice. Pure, no I/O.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Discount type tag as stored and exchanged over the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage,
    Fixed,
    FreeMonths,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountKind::Percentage => "percentage",
            DiscountKind::Fixed => "fixed",
            DiscountKind::FreeMonths => "free_months",
        }
    }
}

impl fmt::Display for DiscountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(DiscountKind::Percentage),
            "fixed" => Ok(DiscountKind::Fixed),
            "free_months" => Ok(DiscountKind::FreeMonths),
            other => Err(format!("unknown discount type '{}'", other)),
        }
    }
}

/// A resolved discount
///
/// Range checks on the value are the coupon author's responsibility: a
/// negative percentage raises the price instead of lowering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discount {
    /// Percent of the base price, nominally 0-100
    Percentage(Decimal),
    /// Currency amount off the base price
    Fixed(Decimal),
    /// First charge waived, this many extra months granted
    FreeMonths(u32),
}

impl Discount {
    /// Build a discount from its stored type tag and raw numeric value
    pub fn from_parts(kind: DiscountKind, value: Decimal) -> Self {
        match kind {
            DiscountKind::Percentage => Discount::Percentage(value),
            DiscountKind::Fixed => Discount::Fixed(value),
            DiscountKind::FreeMonths => {
                Discount::FreeMonths(value.floor().to_u32().unwrap_or(0))
            }
        }
    }

    pub fn kind(&self) -> DiscountKind {
        match self {
            Discount::Percentage(_) => DiscountKind::Percentage,
            Discount::Fixed(_) => DiscountKind::Fixed,
            Discount::FreeMonths(_) => DiscountKind::FreeMonths,
        }
    }
}

/// Result of applying a discount to a base price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscountOutcome {
    /// Amount to charge now
    pub final_price: Decimal,
    /// Currency value taken off the base price
    pub discount_amount: Decimal,
    /// Months granted on top of the paid month
    pub free_months: u32,
}

/// Round a currency amount to cents, half away from zero
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Apply an optional discount to `base_price`
///
/// For free months the waived first charge is reported as the discount
/// amount, so the coupon usage records the monetary value given away.
pub fn apply(base_price: Decimal, discount: Option<Discount>) -> DiscountOutcome {
    let base_price = round_currency(base_price);

    match discount {
        Some(Discount::Percentage(percent)) => {
            let discount_amount = round_currency(base_price * percent / Decimal::ONE_HUNDRED);
            DiscountOutcome {
                final_price: round_currency((base_price - discount_amount).max(Decimal::ZERO)),
                discount_amount,
                free_months: 0,
            }
        }
        Some(Discount::Fixed(amount)) => {
            let discount_amount = round_currency(amount.min(base_price));
            DiscountOutcome {
                final_price: round_currency((base_price - discount_amount).max(Decimal::ZERO)),
                discount_amount,
                free_months: 0,
            }
        }
        Some(Discount::FreeMonths(months)) => DiscountOutcome {
            final_price: Decimal::ZERO,
            discount_amount: base_price,
            free_months: months,
        },
        None => DiscountOutcome {
            final_price: base_price,
            discount_amount: Decimal::ZERO,
            free_months: 0,
        },
    }
}
