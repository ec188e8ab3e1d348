//! Broker capability interface.
//!
//! The engine never speaks a venue's wire protocol; it consumes this small
//! abstract capability. Live adapters, paper venues, and test doubles all
//! implement [`BrokerGateway`] and are substitutable without touching
//! `OrderManager` logic.
//!
//! # Contract
//!
//! - `submit_order` MUST be safe to call more than once with the same
//!   `client_order_id`; the adapter deduplicates at the venue if the venue
//!   does not do so natively.
//! - `cancel_order` fails with [`BrokerError::NotFound`] if the order is
//!   already terminal at the venue.
//! - `fetch_positions` is the venue's authoritative view, used only for
//!   reconciliation — never as the primary write path.
//! - Every call site bounds the call with [`with_timeout`]; an elapsed
//!   timeout is [`BrokerError::Unavailable`], never `Rejected`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tpx_schemas::{FillEvent, OrderType, Side};

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

/// Failure taxonomy for broker operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Transient venue or transport failure. Safe to retry.
    Unavailable { reason: String },
    /// The venue refused the request. Terminal, not retryable.
    Rejected { reason: String },
    /// Session credentials are invalid. Terminal until credentials are
    /// refreshed by the external credential collaborator.
    Unauthenticated,
    /// The referenced order is unknown or already terminal at the venue.
    NotFound,
}

impl BrokerError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        BrokerError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        BrokerError::Rejected {
            reason: reason.into(),
        }
    }

    /// `true` only for transient failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unavailable { .. })
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Unavailable { reason } => write!(f, "broker unavailable: {reason}"),
            BrokerError::Rejected { reason } => write!(f, "broker rejected: {reason}"),
            BrokerError::Unauthenticated => write!(f, "broker session unauthenticated"),
            BrokerError::NotFound => write!(f, "broker order not found"),
        }
    }
}

impl std::error::Error for BrokerError {}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Venue-agnostic order submission request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Caller-side idempotency key; one economic effect per key.
    pub client_order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    /// Present iff `order_type` requires a limit price.
    pub limit_price_micros: Option<i64>,
}

/// Successful submission acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    /// Venue-assigned order reference. Cancel and status calls MUST target
    /// this reference, never the internal order id.
    pub broker_order_ref: String,
}

/// Order status as the venue reports it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueOrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl VenueOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VenueOrderStatus::Filled
                | VenueOrderStatus::Cancelled
                | VenueOrderStatus::Expired
                | VenueOrderStatus::Rejected
        )
    }
}

/// Venue-side view of one order: status, cumulative fill, and the venue's
/// full fill list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub broker_order_ref: String,
    pub status: VenueOrderStatus,
    pub filled_qty: i64,
    pub fills: Vec<FillEvent>,
}

/// Venue-side position, as returned by `fetch_positions`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub qty_signed: i64,
}

// ---------------------------------------------------------------------------
// BrokerGateway trait
// ---------------------------------------------------------------------------

/// The abstract broker capability consumed by the order manager and the
/// reconciliation scheduler.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitAck, BrokerError>;

    async fn cancel_order(&self, broker_order_ref: &str) -> Result<(), BrokerError>;

    async fn fetch_order_status(
        &self,
        broker_order_ref: &str,
    ) -> Result<OrderStatusReport, BrokerError>;

    async fn fetch_positions(&self, account_id: &str)
        -> Result<Vec<VenuePosition>, BrokerError>;
}

// ---------------------------------------------------------------------------
// Timeout wrapper
// ---------------------------------------------------------------------------

/// Bound a gateway call with a timeout.
///
/// An elapsed timeout maps to [`BrokerError::Unavailable`] — the caller
/// cannot know whether the venue acted, so the failure must stay retryable
/// and idempotency-safe.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(BrokerError::Unavailable {
            reason: format!("broker call timed out after {limit:?}"),
        }),
    }
}
