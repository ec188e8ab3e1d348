//! Ledger write boundary and per-position serialization.
//!
//! # Concurrency model
//!
//! Each position lives in its own `tokio::sync::Mutex` cell; the outer map
//! is behind an `RwLock` touched only to look up or insert cells. Updates to
//! one account/symbol serialize on that cell alone — different positions
//! update independently and in parallel. No lock is ever held across IO;
//! every critical section is a short in-memory update.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::types::{LedgerFill, Position, PositionKey};
use crate::wac;

/// Invariant violations surfaced by the ledger write boundary.
///
/// The ledger is never mutated when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    NonPositiveQty { qty: i64 },
    NonPositivePrice { price_micros: i64 },
    EmptyAccount,
    EmptySymbol,
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveQty { qty } => {
                write!(f, "ledger invariant: qty must be > 0, got {qty}")
            }
            Self::NonPositivePrice { price_micros } => {
                write!(
                    f,
                    "ledger invariant: price_micros must be > 0, got {price_micros}"
                )
            }
            Self::EmptyAccount => write!(f, "ledger invariant: account_id must not be empty"),
            Self::EmptySymbol => write!(f, "ledger invariant: symbol must not be empty"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Outcome of [`PositionLedger::apply_fill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerApply {
    /// The fill mutated the position; the updated state is returned.
    Applied(Position),
    /// Duplicate suppression: `ledger_seq` was not greater than the
    /// position's `last_fill_seq_applied`. The ledger was not mutated.
    Duplicate { last_applied: u64 },
}

/// Per-account/per-symbol position ledger.
///
/// Positions are created lazily on first fill and persist indefinitely
/// (possibly flat). The ledger exclusively owns Position records; callers
/// only ever see clones.
#[derive(Default)]
pub struct PositionLedger {
    cells: RwLock<HashMap<PositionKey, Arc<Mutex<Position>>>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, key: &PositionKey) -> Arc<Mutex<Position>> {
        if let Some(cell) = self.cells.read().await.get(key) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write().await;
        Arc::clone(cells.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Position::new(
                key.account_id.clone(),
                key.symbol.clone(),
            )))
        }))
    }

    /// Apply one fill under weighted-average-cost rules.
    ///
    /// Replays (`ledger_seq ≤ last_fill_seq_applied` for the position) are
    /// suppressed as logged no-ops, per the duplicate-suppression contract.
    ///
    /// # Errors
    /// Returns [`LedgerError`] if the fill violates a ledger invariant; the
    /// ledger is not mutated on error.
    pub async fn apply_fill(&self, fill: LedgerFill) -> Result<LedgerApply, LedgerError> {
        Self::validate(&fill)?;

        let key = PositionKey::new(fill.account_id.clone(), fill.symbol.clone());
        let cell = self.cell(&key).await;
        let mut pos = cell.lock().await;

        if fill.ledger_seq <= pos.last_fill_seq_applied {
            warn!(
                account_id = %fill.account_id,
                symbol = %fill.symbol,
                ledger_seq = fill.ledger_seq,
                last_applied = pos.last_fill_seq_applied,
                "duplicate fill suppressed"
            );
            return Ok(LedgerApply::Duplicate {
                last_applied: pos.last_fill_seq_applied,
            });
        }

        wac::apply(&mut pos, fill.side, fill.qty, fill.price_micros);
        pos.last_fill_seq_applied = fill.ledger_seq;
        pos.updated_at = Utc::now();

        debug!(
            account_id = %fill.account_id,
            symbol = %fill.symbol,
            side = %fill.side,
            qty = fill.qty,
            price_micros = fill.price_micros,
            net_qty = pos.net_qty,
            "fill applied to ledger"
        );

        Ok(LedgerApply::Applied(pos.clone()))
    }

    /// Recompute `unrealized_pnl_micros` for every position on `symbol`
    /// from the given mark price. Returns the number of positions updated.
    ///
    /// Pure recomputation from current state — safe to call at any
    /// frequency from a market-data collaborator.
    pub async fn mark_to_market(&self, symbol: &str, mark_micros: i64) -> usize {
        let cells: Vec<Arc<Mutex<Position>>> = {
            let map = self.cells.read().await;
            map.iter()
                .filter(|(k, _)| k.symbol == symbol)
                .map(|(_, c)| Arc::clone(c))
                .collect()
        };

        let mut updated = 0;
        for cell in cells {
            let mut pos = cell.lock().await;
            wac::mark(&mut pos, mark_micros);
            pos.updated_at = Utc::now();
            updated += 1;
        }
        updated
    }

    /// Cloned snapshot of one position, if it exists.
    pub async fn position(&self, account_id: &str, symbol: &str) -> Option<Position> {
        let key = PositionKey::new(account_id, symbol);
        let cell = {
            let map = self.cells.read().await;
            map.get(&key).map(Arc::clone)
        }?;
        let pos = cell.lock().await;
        Some(pos.clone())
    }

    /// All positions for one account, sorted by symbol.
    pub async fn positions_for_account(&self, account_id: &str) -> Vec<Position> {
        let cells: Vec<Arc<Mutex<Position>>> = {
            let map = self.cells.read().await;
            let mut keyed: Vec<(&PositionKey, &Arc<Mutex<Position>>)> = map
                .iter()
                .filter(|(k, _)| k.account_id == account_id)
                .collect();
            keyed.sort_by(|a, b| a.0.symbol.cmp(&b.0.symbol));
            keyed.into_iter().map(|(_, c)| Arc::clone(c)).collect()
        };

        let mut out = Vec::with_capacity(cells.len());
        for cell in cells {
            out.push(cell.lock().await.clone());
        }
        out
    }

    /// Accounts that currently hold a nonzero position, sorted.
    pub async fn accounts_with_nonzero_positions(&self) -> Vec<String> {
        let cells: Vec<(String, Arc<Mutex<Position>>)> = {
            let map = self.cells.read().await;
            map.iter()
                .map(|(k, c)| (k.account_id.clone(), Arc::clone(c)))
                .collect()
        };

        let mut accounts = BTreeSet::new();
        for (account, cell) in cells {
            if !cell.lock().await.is_flat() {
                accounts.insert(account);
            }
        }
        accounts.into_iter().collect()
    }

    fn validate(fill: &LedgerFill) -> Result<(), LedgerError> {
        if fill.account_id.trim().is_empty() {
            return Err(LedgerError::EmptyAccount);
        }
        if fill.symbol.trim().is_empty() {
            return Err(LedgerError::EmptySymbol);
        }
        if fill.qty <= 0 {
            return Err(LedgerError::NonPositiveQty { qty: fill.qty });
        }
        if fill.price_micros <= 0 {
            return Err(LedgerError::NonPositivePrice {
                price_micros: fill.price_micros,
            });
        }
        Ok(())
    }
}
