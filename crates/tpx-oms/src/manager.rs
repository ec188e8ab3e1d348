//! OrderManager — the single entry point to place, cancel, and track orders.
//!
//! # Guarantees
//!
//! - **At-most-one outstanding submission attempt per `client_order_id`**:
//!   the client-id index is the admission gate; a replay of an existing key
//!   returns the existing order without touching the broker.
//! - **At-least-once delivery with idempotent effect**: submission retries
//!   reuse the same `client_order_id`, which adapters deduplicate at the
//!   venue; fill application is idempotent by `(order_id, seq_no)`.
//! - **Per-order serialization**: every order lives behind its own
//!   `tokio::sync::Mutex` — the ownership token for all mutations. Locks
//!   are never held across broker IO.
//!
//! Retryable broker errors are fully contained here; terminal errors
//! surface to the caller AND as the order's final status — a failed order
//! stays queryable with its failure detail, distinct from an order that
//! never existed.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tpx_ledger::{LedgerFill, Position, PositionLedger};
use tpx_schemas::{FillEvent, OrderType, Side};

use crate::gateway::{
    with_timeout, BrokerError, BrokerGateway, OrderStatusReport, SubmitRequest, VenueOrderStatus,
};
use crate::order::{FailureDetail, FailureKind, FillError, Order};
use crate::retry::RetryPolicy;
use crate::state_machine::{OrderEvent, OrderStatus};

// ---------------------------------------------------------------------------
// OmsError
// ---------------------------------------------------------------------------

/// Error taxonomy surfaced by [`OrderManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OmsError {
    /// Bad request shape — rejected before touching the broker.
    Validation { reason: String },
    /// The `client_order_id` exists with divergent parameters; idempotent
    /// replay requires identical parameters.
    Conflict { client_order_id: String },
    /// No order with this id exists (distinct from a failed order, which
    /// remains queryable).
    UnknownOrder { order_id: Uuid },
    /// The operation is not valid for the order's current status.
    InvalidState {
        order_id: Uuid,
        status: OrderStatus,
        reason: String,
    },
    /// A terminal broker failure, surfaced as-is. The order's final status
    /// reflects it.
    Broker(BrokerError),
}

impl std::fmt::Display for OmsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OmsError::Validation { reason } => write!(f, "validation error: {reason}"),
            OmsError::Conflict { client_order_id } => write!(
                f,
                "client_order_id {client_order_id} already exists with different parameters"
            ),
            OmsError::UnknownOrder { order_id } => write!(f, "unknown order {order_id}"),
            OmsError::InvalidState {
                order_id,
                status,
                reason,
            } => write!(f, "order {order_id} in state {status}: {reason}"),
            OmsError::Broker(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OmsError {}

impl From<BrokerError> for OmsError {
    fn from(e: BrokerError) -> Self {
        OmsError::Broker(e)
    }
}

// ---------------------------------------------------------------------------
// Config & request types
// ---------------------------------------------------------------------------

/// Order manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OmsConfig {
    /// Accounts this manager accepts orders for. A request naming any other
    /// account fails validation.
    pub known_accounts: BTreeSet<String>,
    pub retry: RetryPolicy,
    /// Per-call broker timeout; an elapsed timeout is `Unavailable`.
    pub broker_call_timeout_ms: u64,
}

impl Default for OmsConfig {
    fn default() -> Self {
        Self {
            known_accounts: BTreeSet::new(),
            retry: RetryPolicy::default(),
            broker_call_timeout_ms: 2_000,
        }
    }
}

impl OmsConfig {
    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_call_timeout_ms)
    }
}

/// Caller-facing order placement request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Optional caller-supplied idempotency key; generated when absent.
    pub client_order_id: Option<String>,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    pub limit_price_micros: Option<i64>,
}

// ---------------------------------------------------------------------------
// OrderManager
// ---------------------------------------------------------------------------

pub struct OrderManager<B: BrokerGateway> {
    gateway: Arc<B>,
    ledger: Arc<PositionLedger>,
    config: OmsConfig,
    orders: RwLock<HashMap<Uuid, Arc<Mutex<Order>>>>,
    by_client_id: RwLock<HashMap<String, Uuid>>,
    /// Process-wide monotonic sequence tagged onto ledger forwards; strictly
    /// increasing, therefore strictly increasing per position.
    ledger_seq: AtomicU64,
}

impl<B: BrokerGateway> OrderManager<B> {
    pub fn new(gateway: Arc<B>, ledger: Arc<PositionLedger>, config: OmsConfig) -> Self {
        Self {
            gateway,
            ledger,
            config,
            orders: RwLock::new(HashMap::new()),
            by_client_id: RwLock::new(HashMap::new()),
            ledger_seq: AtomicU64::new(0),
        }
    }

    pub fn gateway(&self) -> Arc<B> {
        Arc::clone(&self.gateway)
    }

    pub fn ledger(&self) -> Arc<PositionLedger> {
        Arc::clone(&self.ledger)
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    /// Place an order and drive it through submission.
    ///
    /// Replaying an existing `client_order_id` with identical parameters
    /// returns the existing order without a broker call; divergent
    /// parameters are a [`OmsError::Conflict`].
    ///
    /// Terminal failures return `Err` AND leave the order queryable via
    /// [`get_order`][Self::get_order] in `Rejected`/`Failed` with failure
    /// detail attached.
    pub async fn place_order(&self, req: PlaceOrderRequest) -> Result<Order, OmsError> {
        self.validate(&req)?;

        let client_order_id = req
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let submit_req = SubmitRequest {
            client_order_id: client_order_id.clone(),
            account_id: req.account_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            qty: req.qty,
            limit_price_micros: req.limit_price_micros,
        };

        // Admission gate: insert-if-absent under the index write lock, so
        // two racing calls with the same key cannot both submit.
        let (order_id, cell, replay) = {
            let mut idx = self.by_client_id.write().await;
            match idx.get(&client_order_id) {
                Some(&existing) => {
                    let cell = self
                        .cell(existing)
                        .await
                        .ok_or(OmsError::UnknownOrder { order_id: existing })?;
                    (existing, cell, true)
                }
                None => {
                    let order = Order::new(
                        client_order_id.clone(),
                        req.account_id.clone(),
                        req.symbol.clone(),
                        req.side,
                        req.order_type,
                        req.qty,
                        req.limit_price_micros,
                    );
                    let order_id = order.order_id;
                    let cell = Arc::new(Mutex::new(order));
                    self.orders
                        .write()
                        .await
                        .insert(order_id, Arc::clone(&cell));
                    idx.insert(client_order_id.clone(), order_id);
                    (order_id, cell, false)
                }
            }
        };

        if replay {
            let order = cell.lock().await.clone();
            return if order.matches_params(&submit_req) {
                debug!(
                    order_id = %order_id,
                    client_order_id = %client_order_id,
                    "idempotent replay; returning existing order"
                );
                Ok(order)
            } else {
                Err(OmsError::Conflict { client_order_id })
            };
        }

        info!(
            order_id = %order_id,
            client_order_id = %client_order_id,
            account_id = %req.account_id,
            symbol = %req.symbol,
            side = %req.side,
            qty = req.qty,
            "order accepted"
        );

        self.drive_submission(order_id, &cell, submit_req).await
    }

    /// Submission loop: bounded retries on `Unavailable`, immediate terminal
    /// handling otherwise. Retries sleep between attempts; no lock is held
    /// across the broker call.
    async fn drive_submission(
        &self,
        order_id: Uuid,
        cell: &Arc<Mutex<Order>>,
        req: SubmitRequest,
    ) -> Result<Order, OmsError> {
        {
            let mut o = cell.lock().await;
            o.apply_event(&OrderEvent::SubmitStarted)
                .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
        }

        let timeout = self.config.call_timeout();
        loop {
            let attempt = {
                let mut o = cell.lock().await;
                o.submit_attempts += 1;
                o.next_attempt_at = None;
                o.touch();
                o.submit_attempts
            };

            match with_timeout(timeout, self.gateway.submit_order(&req)).await {
                Ok(ack) => {
                    let cancel_pending = {
                        let mut o = cell.lock().await;
                        o.apply_event(&OrderEvent::SubmitAcked)
                            .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
                        o.broker_order_ref = Some(ack.broker_order_ref.clone());
                        o.touch();
                        o.cancel_requested
                    };
                    info!(
                        order_id = %order_id,
                        broker_order_ref = %ack.broker_order_ref,
                        attempts = attempt,
                        "order submitted"
                    );
                    if cancel_pending {
                        info!(order_id = %order_id, "issuing deferred cancel intent");
                        if let Err(e) = self.cancel_at_venue(order_id, cell).await {
                            warn!(order_id = %order_id, error = %e, "deferred cancel failed");
                        }
                    }
                    return Ok(cell.lock().await.clone());
                }
                Err(e) if e.is_retryable() && self.config.retry.allows_retry(attempt) => {
                    let delay = self.config.retry.delay_after(attempt);
                    {
                        let mut o = cell.lock().await;
                        o.next_attempt_at =
                            Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                        o.touch();
                    }
                    warn!(
                        order_id = %order_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "venue unavailable; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(BrokerError::Rejected { reason }) => {
                    {
                        let mut o = cell.lock().await;
                        o.apply_event(&OrderEvent::SubmitRejected)
                            .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
                        o.failure = Some(FailureDetail {
                            kind: FailureKind::VenueRejected,
                            message: reason.clone(),
                        });
                        o.touch();
                    }
                    warn!(order_id = %order_id, reason = %reason, "order rejected by venue");
                    return Err(OmsError::Broker(BrokerError::Rejected { reason }));
                }
                Err(BrokerError::Unauthenticated) => {
                    {
                        let mut o = cell.lock().await;
                        o.apply_event(&OrderEvent::SubmitFailed)
                            .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
                        o.failure = Some(FailureDetail {
                            kind: FailureKind::Unauthenticated,
                            message: "venue session unauthenticated; refresh credentials and \
                                      re-initiate with a new client_order_id"
                                .to_string(),
                        });
                        o.touch();
                    }
                    warn!(order_id = %order_id, "submission unauthenticated");
                    return Err(OmsError::Broker(BrokerError::Unauthenticated));
                }
                Err(e) => {
                    {
                        let mut o = cell.lock().await;
                        o.apply_event(&OrderEvent::SubmitFailed)
                            .map_err(|err| invalid_state(order_id, o.status, err.to_string()))?;
                        o.failure = Some(FailureDetail {
                            kind: FailureKind::RetriesExhausted,
                            message: format!("{attempt} attempts failed; last error: {e}"),
                        });
                        o.touch();
                    }
                    warn!(
                        order_id = %order_id,
                        attempts = attempt,
                        error = %e,
                        "submission retries exhausted"
                    );
                    return Err(OmsError::Broker(e));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Request cancellation of a non-terminal order.
    ///
    /// While a submission attempt is in flight the cancel is recorded as a
    /// pending intent and applied once the attempt resolves; it never aborts
    /// the attempt. A venue `NotFound` means "already terminal there" and
    /// triggers a status refetch-and-apply instead of an error.
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order, OmsError> {
        let cell = self
            .cell(order_id)
            .await
            .ok_or(OmsError::UnknownOrder { order_id })?;

        {
            let mut o = cell.lock().await;
            if o.is_terminal() {
                return Err(invalid_state(
                    order_id,
                    o.status,
                    "cancel is only valid for non-terminal orders".to_string(),
                ));
            }
            o.cancel_requested = true;
            o.touch();
            if matches!(o.status, OrderStatus::New | OrderStatus::Submitting) {
                info!(order_id = %order_id, "cancel recorded as pending intent");
                return Ok(o.clone());
            }
        }

        self.cancel_at_venue(order_id, &cell).await?;
        let order = cell.lock().await.clone();
        Ok(order)
    }

    async fn cancel_at_venue(
        &self,
        order_id: Uuid,
        cell: &Arc<Mutex<Order>>,
    ) -> Result<(), OmsError> {
        let broker_ref = {
            let o = cell.lock().await;
            o.broker_order_ref.clone().ok_or_else(|| {
                invalid_state(order_id, o.status, "no broker order ref".to_string())
            })?
        };

        let timeout = self.config.call_timeout();
        match with_timeout(timeout, self.gateway.cancel_order(&broker_ref)).await {
            Ok(()) => {
                let mut o = cell.lock().await;
                // A fill may have raced the cancel to terminal; that wins.
                if !o.is_terminal() {
                    o.apply_event(&OrderEvent::CancelAcked)
                        .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
                }
                info!(order_id = %order_id, filled_qty = o.filled_qty, "cancel acknowledged");
                Ok(())
            }
            Err(BrokerError::NotFound) => {
                debug!(
                    order_id = %order_id,
                    "cancel target already terminal at venue; refetching status"
                );
                let report =
                    with_timeout(timeout, self.gateway.fetch_order_status(&broker_ref)).await?;
                self.apply_status_report_cell(order_id, cell, report).await?;
                Ok(())
            }
            Err(e) => Err(OmsError::Broker(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Fill application
    // -----------------------------------------------------------------------

    /// Apply a broker fill notification. Idempotent by `(order_id, seq_no)`;
    /// out-of-order fills are buffered until the gap closes. Applied fills
    /// are forwarded to the position ledger.
    pub async fn apply_fill(&self, order_id: Uuid, fill: FillEvent) -> Result<Order, OmsError> {
        let cell = self
            .cell(order_id)
            .await
            .ok_or(OmsError::UnknownOrder { order_id })?;

        let mut o = cell.lock().await;
        let seq_no = fill.seq_no;
        // The manager owns local identity; adapters key fills by broker ref.
        let mut fill = fill;
        fill.order_id = o.order_id;
        let applied = o
            .record_fill(fill)
            .map_err(|e| fill_error(order_id, o.status, e))?;
        if applied.is_empty() {
            debug!(order_id = %order_id, seq_no, "fill duplicate or buffered out of order");
        }
        self.forward_fills(&o, &applied).await;
        Ok(o.clone())
    }

    /// Reconciliation entry point: converge local state toward a venue
    /// status report through the normal fill path, then adopt any terminal
    /// venue status. Never regresses local progress.
    pub async fn apply_status_report(
        &self,
        order_id: Uuid,
        report: OrderStatusReport,
    ) -> Result<Order, OmsError> {
        let cell = self
            .cell(order_id)
            .await
            .ok_or(OmsError::UnknownOrder { order_id })?;
        self.apply_status_report_cell(order_id, &cell, report).await
    }

    async fn apply_status_report_cell(
        &self,
        order_id: Uuid,
        cell: &Arc<Mutex<Order>>,
        report: OrderStatusReport,
    ) -> Result<Order, OmsError> {
        let mut o = cell.lock().await;

        // 1) Offer the venue's fill list in sequence order, normalized to
        //    the local order identity.
        let mut fills = report.fills.clone();
        fills.sort_by_key(|f| f.seq_no);
        let mut applied = Vec::new();
        for mut fill in fills {
            fill.order_id = o.order_id;
            applied.extend(
                o.record_fill(fill)
                    .map_err(|e| fill_error(order_id, o.status, e))?,
            );
        }

        // 2) The venue list is authoritative once the order is terminal
        //    there: apply any still-buffered fills sorted, gaps included.
        if report.status.is_terminal() {
            applied.extend(
                o.drain_pending_fills()
                    .map_err(|e| fill_error(order_id, o.status, e))?,
            );
        }
        self.forward_fills(&o, &applied).await;

        // 3) Adopt the venue's terminal status.
        match report.status {
            VenueOrderStatus::Cancelled if !o.is_terminal() => {
                o.apply_event(&OrderEvent::CancelAcked)
                    .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
                info!(
                    order_id = %order_id,
                    filled_qty = o.filled_qty,
                    "reconciled to cancelled"
                );
            }
            VenueOrderStatus::Expired if !o.is_terminal() => {
                // Expiry after a partial fill has no Expired edge; it is the
                // cancelled-after-partial shape.
                let ev = if o.filled_qty > 0 {
                    OrderEvent::CancelAcked
                } else {
                    OrderEvent::Expired
                };
                o.apply_event(&ev)
                    .map_err(|e| invalid_state(order_id, o.status, e.to_string()))?;
                info!(order_id = %order_id, "reconciled to expired");
            }
            VenueOrderStatus::Rejected if !o.is_terminal() => {
                // A post-ack venue reject cannot be expressed without
                // regressing; leave it to drift reporting.
                warn!(
                    order_id = %order_id,
                    status = %o.status,
                    "venue reports rejected for an acknowledged order"
                );
            }
            _ => {}
        }

        Ok(o.clone())
    }

    /// Forward applied fills to the position ledger, each tagged with the
    /// next process-wide ledger sequence.
    async fn forward_fills(&self, order: &Order, fills: &[FillEvent]) {
        for fill in fills {
            let ledger_seq = self.ledger_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let forward = LedgerFill {
                account_id: order.account_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                qty: fill.qty,
                price_micros: fill.price_micros,
                ledger_seq,
            };
            if let Err(e) = self.ledger.apply_fill(forward).await {
                // Ledger invariants can only fail here on corrupt fill data
                // that order-level validation already rejects; log loudly.
                warn!(
                    order_id = %order.order_id,
                    seq_no = fill.seq_no,
                    error = %e,
                    "ledger rejected forwarded fill"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub async fn get_order(&self, order_id: Uuid) -> Option<Order> {
        let cell = self.cell(order_id).await?;
        let o = cell.lock().await;
        Some(o.clone())
    }

    pub async fn find_by_client_order_id(&self, client_order_id: &str) -> Option<Order> {
        let order_id = {
            let idx = self.by_client_id.read().await;
            *idx.get(client_order_id)?
        };
        self.get_order(order_id).await
    }

    /// All non-terminal orders for an account, oldest first.
    pub async fn list_open_orders(&self, account_id: &str) -> Vec<Order> {
        let cells: Vec<Arc<Mutex<Order>>> = {
            let map = self.orders.read().await;
            map.values().map(Arc::clone).collect()
        };

        let mut open = Vec::new();
        for cell in cells {
            let o = cell.lock().await;
            if o.is_open() && o.account_id == account_id {
                open.push(o.clone());
            }
        }
        open.sort_by_key(|o| o.created_at);
        open
    }

    /// Positions for one account, straight from the ledger.
    pub async fn get_positions(&self, account_id: &str) -> Vec<Position> {
        self.ledger.positions_for_account(account_id).await
    }

    /// Accounts that currently have at least one open order, sorted.
    pub async fn accounts_with_open_orders(&self) -> Vec<String> {
        let cells: Vec<Arc<Mutex<Order>>> = {
            let map = self.orders.read().await;
            map.values().map(Arc::clone).collect()
        };

        let mut accounts = BTreeSet::new();
        for cell in cells {
            let o = cell.lock().await;
            if o.is_open() {
                accounts.insert(o.account_id.clone());
            }
        }
        accounts.into_iter().collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn cell(&self, order_id: Uuid) -> Option<Arc<Mutex<Order>>> {
        let map = self.orders.read().await;
        map.get(&order_id).map(Arc::clone)
    }

    fn validate(&self, req: &PlaceOrderRequest) -> Result<(), OmsError> {
        if req.qty <= 0 {
            return Err(validation(format!("qty must be > 0, got {}", req.qty)));
        }
        if req.symbol.trim().is_empty() {
            return Err(validation("symbol must not be empty".to_string()));
        }
        if !self.config.known_accounts.contains(&req.account_id) {
            return Err(validation(format!("unknown account {}", req.account_id)));
        }
        match (req.order_type.requires_limit_price(), req.limit_price_micros) {
            (true, None) => {
                return Err(validation(format!(
                    "{} orders require a limit price",
                    req.order_type
                )));
            }
            (false, Some(_)) => {
                return Err(validation(format!(
                    "{} orders must not carry a limit price",
                    req.order_type
                )));
            }
            (true, Some(px)) if px <= 0 => {
                return Err(validation(format!("limit price must be > 0, got {px}")));
            }
            _ => {}
        }
        if let Some(cid) = &req.client_order_id {
            if cid.trim().is_empty() {
                return Err(validation("client_order_id must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

fn validation(reason: String) -> OmsError {
    OmsError::Validation { reason }
}

fn invalid_state(order_id: Uuid, status: OrderStatus, reason: String) -> OmsError {
    OmsError::InvalidState {
        order_id,
        status,
        reason,
    }
}

fn fill_error(order_id: Uuid, status: OrderStatus, e: FillError) -> OmsError {
    OmsError::InvalidState {
        order_id,
        status,
        reason: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    use crate::gateway::SubmitAck;
    use crate::order::FailureKind;

    // -- Broker mock ---------------------------------------------------------

    #[derive(Default)]
    struct MockBroker {
        submits: Mutex<Vec<SubmitRequest>>,
        submit_failures: Mutex<VecDeque<BrokerError>>,
        cancels: Mutex<Vec<String>>,
        cancel_error: Mutex<Option<BrokerError>>,
        reports: Mutex<HashMap<String, OrderStatusReport>>,
        /// When set, submit_order blocks until notified (for race tests).
        gate: Option<Arc<Notify>>,
    }

    impl MockBroker {
        fn broker_ref(client_order_id: &str) -> String {
            format!("v-{client_order_id}")
        }

        async fn fail_next_submits(&self, errors: impl IntoIterator<Item = BrokerError>) {
            self.submit_failures.lock().await.extend(errors);
        }

        async fn submit_count(&self) -> usize {
            self.submits.lock().await.len()
        }
    }

    #[async_trait::async_trait]
    impl BrokerGateway for MockBroker {
        async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitAck, BrokerError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(err) = self.submit_failures.lock().await.pop_front() {
                return Err(err);
            }
            self.submits.lock().await.push(req.clone());
            Ok(SubmitAck {
                broker_order_ref: Self::broker_ref(&req.client_order_id),
            })
        }

        async fn cancel_order(&self, broker_order_ref: &str) -> Result<(), BrokerError> {
            if let Some(err) = self.cancel_error.lock().await.clone() {
                return Err(err);
            }
            self.cancels.lock().await.push(broker_order_ref.to_string());
            Ok(())
        }

        async fn fetch_order_status(
            &self,
            broker_order_ref: &str,
        ) -> Result<OrderStatusReport, BrokerError> {
            self.reports
                .lock()
                .await
                .get(broker_order_ref)
                .cloned()
                .ok_or(BrokerError::NotFound)
        }

        async fn fetch_positions(
            &self,
            _account_id: &str,
        ) -> Result<Vec<crate::gateway::VenuePosition>, BrokerError> {
            Ok(Vec::new())
        }
    }

    // -- Helpers -------------------------------------------------------------

    fn test_config() -> OmsConfig {
        OmsConfig {
            known_accounts: BTreeSet::from(["acct-1".to_string()]),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 4,
                jitter_ms: 0,
            },
            broker_call_timeout_ms: 1_000,
        }
    }

    fn manager(broker: MockBroker) -> OrderManager<MockBroker> {
        OrderManager::new(
            Arc::new(broker),
            Arc::new(PositionLedger::new()),
            test_config(),
        )
    }

    fn limit_buy(client_order_id: &str, qty: i64, limit_micros: i64) -> PlaceOrderRequest {
        PlaceOrderRequest {
            client_order_id: Some(client_order_id.to_string()),
            account_id: "acct-1".to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty,
            limit_price_micros: Some(limit_micros),
        }
    }

    // -- Placement -----------------------------------------------------------

    #[tokio::test]
    async fn place_order_submits_and_records_ref() {
        let m = manager(MockBroker::default());
        let order = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.broker_order_ref.as_deref(), Some("v-A1"));
        assert_eq!(order.submit_attempts, 1);
        assert_eq!(m.gateway().submit_count().await, 1);
    }

    #[tokio::test]
    async fn replay_same_key_yields_same_order_and_one_submission() {
        let m = manager(MockBroker::default());
        let first = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();
        let second = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(m.gateway().submit_count().await, 1);
    }

    #[tokio::test]
    async fn divergent_params_under_same_key_conflict() {
        let m = manager(MockBroker::default());
        m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();

        let err = m.place_order(limit_buy("A1", 200, 50_000_000)).await.unwrap_err();
        assert_eq!(
            err,
            OmsError::Conflict {
                client_order_id: "A1".to_string()
            }
        );
        assert_eq!(m.gateway().submit_count().await, 1);
    }

    #[tokio::test]
    async fn validation_rejects_before_touching_broker() {
        let m = manager(MockBroker::default());

        // zero quantity
        let err = m.place_order(limit_buy("A1", 0, 50_000_000)).await.unwrap_err();
        assert!(matches!(err, OmsError::Validation { .. }));

        // limit order without a price
        let mut req = limit_buy("A2", 10, 50_000_000);
        req.limit_price_micros = None;
        assert!(matches!(
            m.place_order(req).await.unwrap_err(),
            OmsError::Validation { .. }
        ));

        // market order carrying a price
        let req = PlaceOrderRequest {
            client_order_id: Some("A3".to_string()),
            account_id: "acct-1".to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: 10,
            limit_price_micros: Some(50_000_000),
        };
        assert!(matches!(
            m.place_order(req).await.unwrap_err(),
            OmsError::Validation { .. }
        ));

        // unknown account
        let mut req = limit_buy("A4", 10, 50_000_000);
        req.account_id = "nobody".to_string();
        assert!(matches!(
            m.place_order(req).await.unwrap_err(),
            OmsError::Validation { .. }
        ));

        assert_eq!(m.gateway().submit_count().await, 0);
    }

    // -- Retry behavior ------------------------------------------------------

    #[tokio::test]
    async fn unavailable_twice_then_success_submits_exactly_once() {
        let broker = MockBroker::default();
        broker
            .fail_next_submits([
                BrokerError::unavailable("conn reset"),
                BrokerError::unavailable("conn reset"),
            ])
            .await;
        let m = manager(broker);

        let order = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.submit_attempts, 3);
        // exactly one successful venue order, no duplicates
        assert_eq!(m.gateway().submit_count().await, 1);
    }

    #[tokio::test]
    async fn retries_exhausted_leaves_queryable_failed_order() {
        let broker = MockBroker::default();
        broker
            .fail_next_submits(std::iter::repeat(BrokerError::unavailable("down")).take(3))
            .await;
        let m = manager(broker);

        let err = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap_err();
        assert!(matches!(err, OmsError::Broker(BrokerError::Unavailable { .. })));

        let order = m.find_by_client_order_id("A1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        let failure = order.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert_eq!(order.submit_attempts, 3);
    }

    #[tokio::test]
    async fn venue_reject_is_terminal_and_not_retried() {
        let broker = MockBroker::default();
        broker
            .fail_next_submits([BrokerError::rejected("insufficient buying power")])
            .await;
        let m = manager(broker);

        let err = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap_err();
        assert!(matches!(err, OmsError::Broker(BrokerError::Rejected { .. })));

        let order = m.find_by_client_order_id("A1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.submit_attempts, 1);
        assert_eq!(order.failure.unwrap().kind, FailureKind::VenueRejected);
    }

    #[tokio::test]
    async fn unauthenticated_fails_with_distinct_code() {
        let broker = MockBroker::default();
        broker.fail_next_submits([BrokerError::Unauthenticated]).await;
        let m = manager(broker);

        let err = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap_err();
        assert_eq!(err, OmsError::Broker(BrokerError::Unauthenticated));

        let order = m.find_by_client_order_id("A1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.failure.unwrap().kind, FailureKind::Unauthenticated);
    }

    // -- Fills ---------------------------------------------------------------

    #[tokio::test]
    async fn fills_update_order_and_ledger() {
        let m = manager(MockBroker::default());
        let order = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();
        let id = order.order_id;

        m.apply_fill(id, FillEvent::new(id, 1, 60, 49_900_000)).await.unwrap();
        let order = m.apply_fill(id, FillEvent::new(id, 2, 40, 50_000_000)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_qty, 100);
        assert_eq!(order.avg_fill_price_micros, Some(49_940_000));

        let pos = m.ledger().position("acct-1", "AAPL").await.unwrap();
        assert_eq!(pos.net_qty, 100);
        assert_eq!(pos.avg_cost_micros, 49_940_000);
    }

    #[tokio::test]
    async fn out_of_order_fills_converge_without_gap_or_duplication() {
        let m = manager(MockBroker::default());
        let order = m.place_order(limit_buy("A1", 60, 50_000_000)).await.unwrap();
        let id = order.order_id;

        let f1 = FillEvent::new(id, 1, 10, 50_000_000);
        let f2 = FillEvent::new(id, 2, 20, 50_000_000);
        let f3 = FillEvent::new(id, 3, 30, 50_000_000);

        // arrival order [3, 1, 2], plus a replay of 1
        m.apply_fill(id, f3).await.unwrap();
        m.apply_fill(id, f1.clone()).await.unwrap();
        m.apply_fill(id, f1).await.unwrap();
        let order = m.apply_fill(id, f2).await.unwrap();

        assert_eq!(order.filled_qty, 60);
        assert_eq!(order.status, OrderStatus::Filled);
        let pos = m.ledger().position("acct-1", "AAPL").await.unwrap();
        assert_eq!(pos.net_qty, 60);
    }

    // -- Cancellation --------------------------------------------------------

    #[tokio::test]
    async fn cancel_submitted_order() {
        let m = manager(MockBroker::default());
        let order = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();

        let cancelled = m.cancel_order(order.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        let cancels = m.gateway().cancels.lock().await.clone();
        assert_eq!(cancels, vec!["v-A1".to_string()]);
    }

    #[tokio::test]
    async fn cancel_terminal_order_is_invalid() {
        let m = manager(MockBroker::default());
        let order = m.place_order(limit_buy("A1", 10, 50_000_000)).await.unwrap();
        let id = order.order_id;
        m.apply_fill(id, FillEvent::new(id, 1, 10, 50_000_000)).await.unwrap();

        let err = m.cancel_order(id).await.unwrap_err();
        assert!(matches!(err, OmsError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_not_found_refetches_and_applies_venue_truth() {
        let broker = MockBroker::default();
        *broker.cancel_error.lock().await = Some(BrokerError::NotFound);
        let m = manager(broker);

        let order = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();
        let id = order.order_id;

        // Venue truth: cancelled after 30 shares filled.
        let report = OrderStatusReport {
            broker_order_ref: "v-A1".to_string(),
            status: VenueOrderStatus::Cancelled,
            filled_qty: 30,
            fills: vec![FillEvent::new(id, 1, 30, 50_000_000)],
        };
        m.gateway().reports.lock().await.insert("v-A1".to_string(), report);

        let order = m.cancel_order(id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_qty, 30);
        let pos = m.ledger().position("acct-1", "AAPL").await.unwrap();
        assert_eq!(pos.net_qty, 30);
    }

    #[tokio::test]
    async fn cancel_during_submission_is_deferred_then_applied() {
        let gate = Arc::new(Notify::new());
        let broker = MockBroker {
            gate: Some(Arc::clone(&gate)),
            ..MockBroker::default()
        };
        let m = Arc::new(manager(broker));

        let placing = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.place_order(limit_buy("A1", 100, 50_000_000)).await })
        };

        // Wait until the submission attempt is parked in the gateway.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = {
            let order = m.find_by_client_order_id("A1").await.unwrap();
            m.cancel_order(order.order_id).await.unwrap()
        };
        assert_eq!(pending.status, OrderStatus::Submitting);
        assert!(pending.cancel_requested);
        // The in-flight attempt was not aborted.
        assert_eq!(m.gateway().cancels.lock().await.len(), 0);

        // Release the submission; the deferred cancel must follow it.
        gate.notify_one();
        let final_order = placing.await.unwrap().unwrap();
        assert_eq!(final_order.status, OrderStatus::Cancelled);
        let cancels = m.gateway().cancels.lock().await.clone();
        assert_eq!(cancels, vec!["v-A1".to_string()]);
    }

    // -- Reconciliation entry point ------------------------------------------

    #[tokio::test]
    async fn status_report_repairs_cancelled_with_missed_fills() {
        let m = manager(MockBroker::default());
        let order = m.place_order(limit_buy("A1", 100, 50_000_000)).await.unwrap();
        let id = order.order_id;
        assert_eq!(order.filled_qty, 0);

        let report = OrderStatusReport {
            broker_order_ref: "v-A1".to_string(),
            status: VenueOrderStatus::Cancelled,
            filled_qty: 30,
            fills: vec![FillEvent::new(id, 1, 30, 50_000_000)],
        };
        let repaired = m.apply_status_report(id, report.clone()).await.unwrap();
        assert_eq!(repaired.status, OrderStatus::Cancelled);
        assert_eq!(repaired.filled_qty, 30);
        let pos = m.ledger().position("acct-1", "AAPL").await.unwrap();
        assert_eq!(pos.net_qty, 30);

        // Idempotent: a second pass changes nothing.
        let again = m.apply_status_report(id, report).await.unwrap();
        assert_eq!(again.filled_qty, 30);
        assert_eq!(again.status, OrderStatus::Cancelled);
        let pos = m.ledger().position("acct-1", "AAPL").await.unwrap();
        assert_eq!(pos.net_qty, 30);
    }

    #[tokio::test]
    async fn unknown_order_is_distinct_from_failed_order() {
        let m = manager(MockBroker::default());
        let ghost = Uuid::new_v4();
        assert_eq!(
            m.cancel_order(ghost).await.unwrap_err(),
            OmsError::UnknownOrder { order_id: ghost }
        );
        assert!(m.get_order(ghost).await.is_none());
    }
}
