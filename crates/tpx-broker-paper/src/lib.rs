//! Deterministic in-memory "paper" venue.
//!
//! Implements [`BrokerGateway`] for tests and simulated runs. Design
//! decisions, kept intentionally simple and deterministic:
//!
//! - `broker_order_ref` is `"paper:{client_order_id}"`.
//! - Submission is idempotent by `client_order_id`: a repeated submit
//!   returns the same acknowledgement without creating a second order.
//! - Fills are never auto-generated. Tests script them with
//!   [`PaperVenue::push_fill`], which assigns the next per-order sequence
//!   number and maintains venue-side positions.
//! - Venue-side lifecycle events (`venue_cancel`, `venue_expire`) and
//!   failure injection (`fail_next_submits`) let tests drive every drift
//!   and retry scenario the engine must survive.
//!
//! Fill events leave this venue with a nil `order_id`; the order manager
//! normalizes fills to its own order identity on ingestion (a venue only
//! knows broker refs).

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use tpx_oms::{
    BrokerError, BrokerGateway, OrderStatusReport, SubmitAck, SubmitRequest, VenueOrderStatus,
    VenuePosition,
};
use tpx_schemas::{FillEvent, Side};

// ---------------------------------------------------------------------------
// Venue state
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct VenueOrder {
    broker_order_ref: String,
    account_id: String,
    symbol: String,
    side: Side,
    qty: i64,
    filled_qty: i64,
    next_seq: u64,
    status: VenueOrderStatus,
    fills: Vec<FillEvent>,
}

#[derive(Default)]
struct VenueState {
    /// Keyed by client_order_id — the venue-native dedup key.
    orders: BTreeMap<String, VenueOrder>,
    /// (account_id, symbol) -> signed quantity, derived from scripted fills.
    positions: BTreeMap<(String, String), i64>,
    submit_failures: VecDeque<BrokerError>,
    submit_calls: usize,
    orders_created: usize,
}

/// Deterministic in-memory broker venue.
#[derive(Default)]
pub struct PaperVenue {
    state: Mutex<VenueState>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_ref(client_order_id: &str) -> String {
        format!("paper:{client_order_id}")
    }

    // -----------------------------------------------------------------------
    // Scripting surface (tests / simulations)
    // -----------------------------------------------------------------------

    /// Queue errors returned by the next submit calls, in order.
    pub async fn fail_next_submits(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.state.lock().await.submit_failures.extend(errors);
    }

    /// Execute `qty` at `price_micros` against an open order, assigning the
    /// next per-order sequence number. Returns the fill event so tests can
    /// also deliver it as a push notification.
    ///
    /// # Panics
    /// Panics if the order does not exist or is terminal — a scripting bug.
    pub async fn push_fill(&self, client_order_id: &str, qty: i64, price_micros: i64) -> FillEvent {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let order = state
            .orders
            .get_mut(client_order_id)
            .unwrap_or_else(|| panic!("push_fill: unknown order {client_order_id}"));
        assert!(
            !order.status.is_terminal(),
            "push_fill: order {client_order_id} is terminal"
        );
        assert!(
            order.filled_qty + qty <= order.qty,
            "push_fill: overfill scripted for {client_order_id}"
        );

        let fill = FillEvent::new(Uuid::nil(), order.next_seq, qty, price_micros);
        order.next_seq += 1;
        order.filled_qty += qty;
        order.status = if order.filled_qty == order.qty {
            VenueOrderStatus::Filled
        } else {
            VenueOrderStatus::PartiallyFilled
        };
        order.fills.push(fill.clone());

        let key = (order.account_id.clone(), order.symbol.clone());
        let delta = order.side.sign() * qty;
        *state.positions.entry(key).or_insert(0) += delta;

        fill
    }

    /// Venue-side cancel (e.g. operator action or market close) that the
    /// engine has not observed yet.
    pub async fn venue_cancel(&self, client_order_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(client_order_id) {
            if !order.status.is_terminal() {
                order.status = VenueOrderStatus::Cancelled;
            }
        }
    }

    /// Venue-side expiry.
    pub async fn venue_expire(&self, client_order_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(client_order_id) {
            if !order.status.is_terminal() {
                order.status = VenueOrderStatus::Expired;
            }
        }
    }

    /// Force a venue position, bypassing fill bookkeeping. For drift
    /// scenarios where the venue and the local ledger must disagree.
    pub async fn set_position(&self, account_id: &str, symbol: &str, qty_signed: i64) {
        let mut state = self.state.lock().await;
        state
            .positions
            .insert((account_id.to_string(), symbol.to_string()), qty_signed);
    }

    /// Total submit calls that reached the venue (including deduped replays,
    /// excluding injected failures).
    pub async fn submit_calls(&self) -> usize {
        self.state.lock().await.submit_calls
    }

    /// Orders actually created at the venue — the idempotency meter.
    pub async fn orders_created(&self) -> usize {
        self.state.lock().await.orders_created
    }
}

// ---------------------------------------------------------------------------
// BrokerGateway impl
// ---------------------------------------------------------------------------

#[async_trait]
impl BrokerGateway for PaperVenue {
    async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitAck, BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        state.submit_calls += 1;

        // Idempotent: an existing client_order_id returns the same ack.
        if let Some(existing) = state.orders.get(&req.client_order_id) {
            return Ok(SubmitAck {
                broker_order_ref: existing.broker_order_ref.clone(),
            });
        }

        let broker_order_ref = Self::make_ref(&req.client_order_id);
        state.orders.insert(
            req.client_order_id.clone(),
            VenueOrder {
                broker_order_ref: broker_order_ref.clone(),
                account_id: req.account_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                filled_qty: 0,
                next_seq: 1,
                status: VenueOrderStatus::Accepted,
                fills: Vec::new(),
            },
        );
        state.orders_created += 1;

        Ok(SubmitAck { broker_order_ref })
    }

    async fn cancel_order(&self, broker_order_ref: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .values_mut()
            .find(|o| o.broker_order_ref == broker_order_ref)
            .ok_or(BrokerError::NotFound)?;
        if order.status.is_terminal() {
            return Err(BrokerError::NotFound);
        }
        order.status = VenueOrderStatus::Cancelled;
        Ok(())
    }

    async fn fetch_order_status(
        &self,
        broker_order_ref: &str,
    ) -> Result<OrderStatusReport, BrokerError> {
        let state = self.state.lock().await;
        let order = state
            .orders
            .values()
            .find(|o| o.broker_order_ref == broker_order_ref)
            .ok_or(BrokerError::NotFound)?;
        Ok(OrderStatusReport {
            broker_order_ref: order.broker_order_ref.clone(),
            status: order.status,
            filled_qty: order.filled_qty,
            fills: order.fills.clone(),
        })
    }

    async fn fetch_positions(&self, account_id: &str) -> Result<Vec<VenuePosition>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .positions
            .iter()
            .filter(|((account, _), _)| account == account_id)
            .map(|((_, symbol), qty)| VenuePosition {
                symbol: symbol.clone(),
                qty_signed: *qty,
            })
            .collect())
    }
}
