use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tpx_schemas::Side;

/// Ledger addressing key: one position per (account, symbol).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub account_id: String,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(account_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            symbol: symbol.into(),
        }
    }
}

/// Aggregate position state for one account/symbol pair.
///
/// Invariant: `net_qty` equals the signed sum of all applied fill quantities
/// (Buy positive, Sell negative) since the position was created. Positions
/// are created lazily on first fill and never deleted — a closed position
/// persists with `net_qty == 0`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    /// Signed net quantity: +long, -short, 0 flat.
    pub net_qty: i64,
    /// Weighted-average cost basis of the open quantity, in micros.
    /// Zero while flat.
    pub avg_cost_micros: i64,
    /// Accumulated realized PnL in micros. Moves only on reducing fills.
    pub realized_pnl_micros: i64,
    /// Mark-to-market PnL in micros, recomputed by
    /// [`PositionLedger::mark_to_market`](crate::PositionLedger::mark_to_market).
    pub unrealized_pnl_micros: i64,
    /// Highest ledger sequence applied to this position (duplicate guard).
    pub last_fill_seq_applied: u64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(account_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            symbol: symbol.into(),
            net_qty: 0,
            avg_cost_micros: 0,
            realized_pnl_micros: 0,
            unrealized_pnl_micros: 0,
            last_fill_seq_applied: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.net_qty == 0
    }
}

/// A fill as forwarded to the ledger by the order layer.
///
/// `ledger_seq` is a process-wide monotonic sequence assigned at forward
/// time — strictly increasing, therefore strictly increasing per position.
/// It is NOT the broker's per-order fill sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFill {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price_micros: i64,
    pub ledger_seq: u64,
}
