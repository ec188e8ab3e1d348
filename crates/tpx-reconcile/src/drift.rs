//! Drift detection — pure, deterministic comparison of local state against
//! venue truth.
//!
//! Two comparisons, both side-effect free:
//!
//! - [`order_drift`]: is the local order behind the venue (missing fills or
//!   a terminal status to adopt), in sync, or — the alarming case — ahead
//!   of it? Local progress is never undone; "ahead" is evidence, not an
//!   instruction to regress.
//! - [`position_diffs`]: per-symbol quantity comparison under a configured
//!   tolerance, run only after order statuses have been reconciled.
//!   Out-of-tolerance diffs become alerts, never silent corrections —
//!   blind overwrite could erase legitimate fill history.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use tpx_ledger::Position;
use tpx_oms::{OrderStatus, OrderStatusReport, VenuePosition};

// ---------------------------------------------------------------------------
// Order drift
// ---------------------------------------------------------------------------

/// Relationship between a local order and the venue's report of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderDrift {
    /// Venue and local agree on progress and liveness.
    InSync,
    /// The venue reports progress the local order lacks. Repair by feeding
    /// the report through the normal status-report path.
    BehindVenue {
        missing_qty: i64,
        venue_terminal: bool,
    },
    /// The local order shows more filled quantity than the venue reports.
    /// Progress is never regressed; this is reported as drift evidence.
    AheadOfVenue {
        local_filled: i64,
        venue_filled: i64,
    },
}

/// Classify one local order against its venue status report.
pub fn order_drift(
    local_filled_qty: i64,
    local_status: OrderStatus,
    report: &OrderStatusReport,
) -> OrderDrift {
    if report.filled_qty < local_filled_qty {
        return OrderDrift::AheadOfVenue {
            local_filled: local_filled_qty,
            venue_filled: report.filled_qty,
        };
    }

    let missing_qty = report.filled_qty - local_filled_qty;
    let venue_terminal = report.status.is_terminal();
    if missing_qty > 0 || (venue_terminal && !local_status.is_terminal()) {
        return OrderDrift::BehindVenue {
            missing_qty,
            venue_terminal,
        };
    }

    OrderDrift::InSync
}

// ---------------------------------------------------------------------------
// Position drift
// ---------------------------------------------------------------------------

/// Evidence of one out-of-tolerance position mismatch.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionDiff {
    pub symbol: String,
    pub local_qty: i64,
    pub venue_qty: i64,
}

impl PositionDiff {
    pub fn drift_abs(&self) -> i64 {
        (self.local_qty - self.venue_qty).abs()
    }
}

/// Compare local positions against the venue's authoritative view for one
/// account. Returns the out-of-tolerance mismatches, sorted by symbol.
///
/// Symbols are compared over the union of both sides: a position the venue
/// has and we lack (or vice versa) is drift like any other.
pub fn position_diffs(
    local: &[Position],
    venue: &[VenuePosition],
    tolerance: i64,
) -> Vec<PositionDiff> {
    let mut symbols: BTreeSet<&str> = BTreeSet::new();
    for p in local {
        symbols.insert(p.symbol.as_str());
    }
    for p in venue {
        symbols.insert(p.symbol.as_str());
    }

    let mut diffs = Vec::new();
    for symbol in symbols {
        let local_qty = local
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.net_qty)
            .unwrap_or(0);
        let venue_qty = venue
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.qty_signed)
            .unwrap_or(0);
        if (local_qty - venue_qty).abs() > tolerance {
            diffs.push(PositionDiff {
                symbol: symbol.to_string(),
                local_qty,
                venue_qty,
            });
        }
    }
    diffs
}
