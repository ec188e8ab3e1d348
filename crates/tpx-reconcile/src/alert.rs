//! Reconciliation alert bus.
//!
//! Position drift beyond tolerance is REPORTED, never silently corrected.
//! Alerts fan out over a `tokio::sync::broadcast` channel; collaborators
//! (an API layer, an operator console) subscribe as a stream. Publishing
//! never blocks and never fails the reconciliation pass — a slow or absent
//! subscriber loses alerts, it does not stall trading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Unrecoverable position inconsistency discovered by a reconciliation
/// pass after order statuses were fully reconciled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAlert {
    pub account_id: String,
    pub symbol: String,
    pub local_qty: i64,
    pub venue_qty: i64,
    pub tolerance: i64,
    pub observed_at: DateTime<Utc>,
}

/// Broadcast bus carrying [`ReconciliationAlert`]s to any number of
/// subscribers.
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<ReconciliationAlert>,
}

impl AlertBus {
    /// `capacity` bounds how many unconsumed alerts a lagging subscriber
    /// may buffer before it starts losing the oldest.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to alerts published after this call.
    pub fn subscribe(&self) -> BroadcastStream<ReconciliationAlert> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Publish an alert. A send error only means there are currently no
    /// subscribers; the alert is still logged by the caller.
    pub fn publish(&self, alert: ReconciliationAlert) {
        if self.tx.send(alert).is_err() {
            debug!("reconciliation alert published with no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(64)
    }
}
