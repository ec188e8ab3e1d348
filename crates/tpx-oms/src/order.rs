//! The Order entity and its per-order fill book.
//!
//! An `Order` owns everything needed to apply fills correctly regardless of
//! arrival order: the monotonic fill book (duplicate suppression plus an
//! out-of-order buffer), the quantity-weighted average fill price, and the
//! status recomputation after each applied fill. The `OrderManager` holds
//! each order behind its own mutex; nothing in this module is aware of
//! concurrency.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tpx_schemas::{FillEvent, OrderType, Side};

use crate::gateway::SubmitRequest;
use crate::state_machine::{transition, OrderEvent, OrderStatus, TransitionError};

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Why an order ended in a terminal failure state.
///
/// Distinct kinds let a caller tell "refresh credentials and re-initiate"
/// apart from "the venue is down, re-initiate later" — per the error
/// taxonomy, a failed order is always queryable with this detail attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Submission retries exhausted against an unavailable venue.
    RetriesExhausted,
    /// The venue session is unauthenticated; credentials must be refreshed
    /// out-of-band before re-initiating.
    Unauthenticated,
    /// The venue refused the order outright.
    VenueRejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// FillError
// ---------------------------------------------------------------------------

/// Errors from applying a fill to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillError {
    /// The fill would push `filled_qty` past `requested_qty`. Indicates
    /// corrupt venue data; the order is NOT mutated.
    Overfill {
        seq_no: u64,
        fill_qty: i64,
        filled_qty: i64,
        requested_qty: i64,
    },
    /// The order's state does not admit fills.
    Transition(TransitionError),
}

impl std::fmt::Display for FillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillError::Overfill {
                seq_no,
                fill_qty,
                filled_qty,
                requested_qty,
            } => write!(
                f,
                "fill seq {seq_no} qty {fill_qty} would overfill order \
                 ({filled_qty}/{requested_qty} already filled)"
            ),
            FillError::Transition(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FillError {}

impl From<TransitionError> for FillError {
    fn from(e: TransitionError) -> Self {
        FillError::Transition(e)
    }
}

// ---------------------------------------------------------------------------
// FillBook
// ---------------------------------------------------------------------------

/// Per-order fill sequencing: duplicate suppression and out-of-order
/// buffering.
///
/// Broker fill sequence numbers are strictly increasing per order, starting
/// at 1. A fill whose sequence number has already been applied is a no-op;
/// a fill ahead of the expected next sequence number is buffered until the
/// gap closes (or until reconciliation drains the buffer sorted).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct FillBook {
    last_applied_seq: u64,
    pending: BTreeMap<u64, FillEvent>,
}

impl FillBook {
    /// Offer a fill; returns the contiguous run that became applicable, in
    /// sequence order. Duplicates return an empty vec.
    fn offer(&mut self, fill: FillEvent) -> Vec<FillEvent> {
        if fill.seq_no <= self.last_applied_seq {
            return Vec::new();
        }
        // Re-offering a buffered sequence number overwrites idempotently.
        self.pending.insert(fill.seq_no, fill);

        let mut run = Vec::new();
        while let Some(next) = self.pending.remove(&(self.last_applied_seq + 1)) {
            self.last_applied_seq = next.seq_no;
            run.push(next);
        }
        run
    }

    /// Drain every buffered fill in sequence order, gaps included. Used by
    /// reconciliation, where the venue's fill list is authoritative.
    fn drain_sorted(&mut self) -> Vec<FillEvent> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some((seq, fill)) = self.pending.pop_first() {
            self.last_applied_seq = seq;
            out.push(fill);
        }
        out
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A tracked order through its whole lifecycle.
///
/// Immutable once terminal (fill precedence aside). `version` is a monotonic
/// counter bumped on every mutation, usable for optimistic concurrency by a
/// persistence collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    /// Caller idempotency key. Immutable, unique across the manager.
    pub client_order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_qty: i64,
    pub limit_price_micros: Option<i64>,
    pub status: OrderStatus,
    pub filled_qty: i64,
    /// Quantity-weighted average fill price; `Some` iff `filled_qty > 0`.
    pub avg_fill_price_micros: Option<i64>,
    /// Venue-assigned reference, recorded on successful submission.
    pub broker_order_ref: Option<String>,
    /// Explicit retry state: attempts made and, mid-backoff, when the next
    /// attempt becomes eligible. Survives persistence, unlike call-stack
    /// recursion.
    pub submit_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Pending cancel intent, applied once the in-flight attempt resolves.
    pub cancel_requested: bool,
    pub failure: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    /// Applied fills, append-only, in application (= sequence) order.
    pub fills: Vec<FillEvent>,
    fill_book: FillBook,
}

impl Order {
    pub fn new(
        client_order_id: impl Into<String>,
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        requested_qty: i64,
        limit_price_micros: Option<i64>,
    ) -> Self {
        debug_assert!(requested_qty > 0, "Order.requested_qty must be > 0");
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4(),
            client_order_id: client_order_id.into(),
            account_id: account_id.into(),
            symbol: symbol.into(),
            side,
            order_type,
            requested_qty,
            limit_price_micros,
            status: OrderStatus::New,
            filled_qty: 0,
            avg_fill_price_micros: None,
            broker_order_ref: None,
            submit_attempts: 0,
            next_attempt_at: None,
            cancel_requested: false,
            failure: None,
            created_at: now,
            updated_at: now,
            version: 1,
            fills: Vec::new(),
            fill_book: FillBook::default(),
        }
    }

    /// The request this order submits to the venue.
    pub fn submit_request(&self) -> SubmitRequest {
        SubmitRequest {
            client_order_id: self.client_order_id.clone(),
            account_id: self.account_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            qty: self.requested_qty,
            limit_price_micros: self.limit_price_micros,
        }
    }

    /// `true` if the caller-visible parameters match `req` — the condition
    /// for idempotent replay under the same client order id.
    pub fn matches_params(&self, req: &SubmitRequest) -> bool {
        self.account_id == req.account_id
            && self.symbol == req.symbol
            && self.side == req.side
            && self.order_type == req.order_type
            && self.requested_qty == req.qty
            && self.limit_price_micros == req.limit_price_micros
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Open = participating in submission or live at the venue.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Bump `updated_at`/`version`. Call after every mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Apply a lifecycle event to the status.
    pub fn apply_event(&mut self, event: &OrderEvent) -> Result<(), TransitionError> {
        let next = transition(self.status, event)?;
        if next != self.status {
            self.status = next;
        }
        self.touch();
        Ok(())
    }

    /// Record one incoming fill: dedupe by sequence number, buffer if out of
    /// order, and apply every fill that became applicable.
    ///
    /// Returns the fills actually applied (possibly empty for duplicates or
    /// buffered gaps), in sequence order, for forwarding to the ledger.
    pub fn record_fill(&mut self, fill: FillEvent) -> Result<Vec<FillEvent>, FillError> {
        let run = self.fill_book.offer(fill);
        self.apply_run(run)
    }

    /// Apply every buffered fill in sequence order regardless of gaps.
    /// Reconciliation calls this after offering the venue's authoritative
    /// fill list.
    pub fn drain_pending_fills(&mut self) -> Result<Vec<FillEvent>, FillError> {
        if !self.fill_book.has_pending() {
            return Ok(Vec::new());
        }
        let run = self.fill_book.drain_sorted();
        self.apply_run(run)
    }

    fn apply_run(&mut self, run: Vec<FillEvent>) -> Result<Vec<FillEvent>, FillError> {
        let mut applied = Vec::with_capacity(run.len());
        for fill in run {
            self.apply_one(&fill)?;
            applied.push(fill);
        }
        Ok(applied)
    }

    fn apply_one(&mut self, fill: &FillEvent) -> Result<(), FillError> {
        if self.filled_qty + fill.qty > self.requested_qty {
            return Err(FillError::Overfill {
                seq_no: fill.seq_no,
                fill_qty: fill.qty,
                filled_qty: self.filled_qty,
                requested_qty: self.requested_qty,
            });
        }

        let completes = self.filled_qty + fill.qty == self.requested_qty;
        self.apply_event(&OrderEvent::Fill { completes })?;

        self.avg_fill_price_micros = Some(weighted_avg_price(
            self.filled_qty,
            self.avg_fill_price_micros.unwrap_or(0),
            fill.qty,
            fill.price_micros,
        ));
        self.filled_qty += fill.qty;
        self.fills.push(fill.clone());
        self.touch();
        Ok(())
    }
}

/// Quantity-weighted average price update, rounded to the nearest micro.
fn weighted_avg_price(filled_qty: i64, avg_micros: i64, add_qty: i64, price_micros: i64) -> i64 {
    debug_assert!(filled_qty >= 0 && add_qty > 0);
    let num =
        (filled_qty as i128) * (avg_micros as i128) + (add_qty as i128) * (price_micros as i128);
    let den = (filled_qty + add_qty) as i128;
    let rounded = (num + den / 2) / den;
    if rounded > i64::MAX as i128 {
        i64::MAX
    } else {
        rounded as i64
    }
}
