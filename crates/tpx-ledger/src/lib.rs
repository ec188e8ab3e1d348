//! tpx-ledger
//!
//! Position & PnL ledger:
//! - Per-(account, symbol) positions derived exclusively from fills
//! - Weighted-average-cost basis accounting
//! - Realized PnL on quantity-reducing fills only; unrealized PnL
//!   recomputed from externally supplied marks
//! - Duplicate suppression by monotonic ledger sequence
//!
//! The accounting rules live in the pure, deterministic [`wac`] module;
//! [`PositionLedger`] owns the invariant-checking write boundary and the
//! per-position serialization cells.

mod ledger;
mod types;

pub mod wac;

pub use ledger::{LedgerApply, LedgerError, PositionLedger};
pub use types::{LedgerFill, Position, PositionKey};
