//! tpx-schemas
//!
//! Shared domain primitives for the order/position engine:
//! - [`Side`] and [`OrderType`] enums used on every order surface
//! - [`FillEvent`], the append-only fill record
//! - integer-micros price representation ([`prices`])
//!
//! This crate is dependency-light by design: every other tpx crate consumes
//! these types, so nothing heavier than serde/uuid/chrono belongs here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod prices;

pub use prices::{micros_to_price, price_to_micros, PricingError, MICROS_PER_UNIT};

/// BUY or SELL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Signed direction multiplier: Buy = +1, Sell = -1.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order pricing model. Limit and Stop orders carry a limit price.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    /// `true` if this order type requires a limit price.
    pub fn requires_limit_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::Stop)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
        }
    }
}

/// A broker-reported execution of part (or all) of an order.
///
/// Fills are append-only: once recorded they are never mutated or deleted.
/// `seq_no` is broker-assigned and strictly increasing per order; fills are
/// applied in `seq_no` order regardless of arrival order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: Uuid,
    pub order_id: Uuid,
    /// Broker-assigned, strictly increasing per order, starting at 1.
    pub seq_no: u64,
    /// Executed quantity, always positive.
    pub qty: i64,
    /// Execution price in integer micros.
    pub price_micros: i64,
    pub ts_utc: DateTime<Utc>,
}

impl FillEvent {
    pub fn new(order_id: Uuid, seq_no: u64, qty: i64, price_micros: i64) -> Self {
        debug_assert!(qty > 0, "FillEvent.qty must be > 0");
        debug_assert!(price_micros > 0, "FillEvent.price_micros must be > 0");
        Self {
            fill_id: Uuid::new_v4(),
            order_id,
            seq_no,
            qty,
            price_micros,
            ts_utc: Utc::now(),
        }
    }
}
