//! Periodic reconciliation scheduler.
//!
//! On a fixed interval, every account with open orders or nonzero positions
//! is audited against venue truth:
//!
//! 1. **Order statuses first.** Each open order with a broker ref is
//!    refetched; a behind-venue order is repaired through the normal
//!    `OrderManager::apply_status_report` path — the same code path live
//!    fill delivery uses, so repair is idempotent and never regresses
//!    progress.
//! 2. **Positions second.** Only after status repair are venue positions
//!    compared to the ledger. Out-of-tolerance drift becomes a
//!    [`ReconciliationAlert`] on the bus — reported, not corrected.
//!
//! Passes are idempotent and safe to run concurrently with live order
//! placement: every mutation goes through the manager's per-order locks.
//! A venue error during a pass is logged and retried on the next tick;
//! reconciliation must never halt ongoing trading.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tpx_ledger::PositionLedger;
use tpx_oms::{with_timeout, BrokerGateway, OrderManager};

use crate::alert::{AlertBus, ReconciliationAlert};
use crate::drift::{order_drift, position_diffs, OrderDrift};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Reconciliation pass configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between passes.
    pub interval_ms: u64,
    /// Absolute share-quantity tolerance before position drift alerts.
    /// Whole-share venues keep this at 0.
    pub position_tolerance: i64,
    /// Per-call venue timeout within a pass.
    pub broker_call_timeout_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            position_tolerance: 0,
            broker_call_timeout_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Outcome counters for one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub accounts: usize,
    pub orders_checked: usize,
    pub orders_repaired: usize,
    /// Orders whose local fill progress exceeds the venue's report.
    pub orders_ahead: usize,
    pub alerts: usize,
    /// Venue call failures; retried on the next pass.
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct ReconciliationScheduler<B: BrokerGateway> {
    gateway: Arc<B>,
    manager: Arc<OrderManager<B>>,
    ledger: Arc<PositionLedger>,
    config: ReconcileConfig,
    bus: AlertBus,
}

impl<B: BrokerGateway + 'static> ReconciliationScheduler<B> {
    pub fn new(manager: Arc<OrderManager<B>>, config: ReconcileConfig) -> Self {
        Self {
            gateway: manager.gateway(),
            ledger: manager.ledger(),
            manager,
            config,
            bus: AlertBus::default(),
        }
    }

    /// Subscribe to the reconciliation alert stream.
    pub fn alerts(&self) -> tokio_stream::wrappers::BroadcastStream<ReconciliationAlert> {
        self.bus.subscribe()
    }

    /// Run one full reconciliation pass over every in-scope account.
    pub async fn run_once(&self) -> ReconcileSummary {
        let mut accounts = self.manager.accounts_with_open_orders().await;
        for account in self.ledger.accounts_with_nonzero_positions().await {
            if !accounts.contains(&account) {
                accounts.push(account);
            }
        }
        accounts.sort();

        let mut summary = ReconcileSummary {
            accounts: accounts.len(),
            ..ReconcileSummary::default()
        };
        for account in &accounts {
            self.reconcile_account(account, &mut summary).await;
        }
        summary
    }

    async fn reconcile_account(&self, account_id: &str, summary: &mut ReconcileSummary) {
        let timeout = Duration::from_millis(self.config.broker_call_timeout_ms);

        // 1) Order status reconciliation.
        for order in self.manager.list_open_orders(account_id).await {
            let Some(broker_ref) = order.broker_order_ref.clone() else {
                // Never acknowledged by the venue; nothing to fetch.
                continue;
            };
            summary.orders_checked += 1;

            let report =
                match with_timeout(timeout, self.gateway.fetch_order_status(&broker_ref)).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(
                            order_id = %order.order_id,
                            error = %e,
                            "status fetch failed; retrying next pass"
                        );
                        summary.errors += 1;
                        continue;
                    }
                };

            match order_drift(order.filled_qty, order.status, &report) {
                OrderDrift::InSync => {}
                OrderDrift::BehindVenue {
                    missing_qty,
                    venue_terminal,
                } => {
                    info!(
                        order_id = %order.order_id,
                        missing_qty,
                        venue_terminal,
                        "repairing order from venue report"
                    );
                    match self.manager.apply_status_report(order.order_id, report).await {
                        Ok(_) => summary.orders_repaired += 1,
                        Err(e) => {
                            error!(
                                order_id = %order.order_id,
                                error = %e,
                                "status report repair failed"
                            );
                            summary.errors += 1;
                        }
                    }
                }
                OrderDrift::AheadOfVenue {
                    local_filled,
                    venue_filled,
                } => {
                    warn!(
                        order_id = %order.order_id,
                        local_filled,
                        venue_filled,
                        "local order ahead of venue report"
                    );
                    summary.orders_ahead += 1;
                }
            }
        }

        // 2) Position reconciliation, only after status repair.
        let venue_positions =
            match with_timeout(timeout, self.gateway.fetch_positions(account_id)).await {
                Ok(positions) => positions,
                Err(e) => {
                    warn!(
                        account_id,
                        error = %e,
                        "position fetch failed; retrying next pass"
                    );
                    summary.errors += 1;
                    return;
                }
            };

        let local = self.ledger.positions_for_account(account_id).await;
        for diff in position_diffs(&local, &venue_positions, self.config.position_tolerance) {
            error!(
                account_id,
                symbol = %diff.symbol,
                local_qty = diff.local_qty,
                venue_qty = diff.venue_qty,
                "position drift beyond tolerance"
            );
            self.bus.publish(ReconciliationAlert {
                account_id: account_id.to_string(),
                symbol: diff.symbol,
                local_qty: diff.local_qty,
                venue_qty: diff.venue_qty,
                tolerance: self.config.position_tolerance,
                observed_at: Utc::now(),
            });
            summary.alerts += 1;
        }
    }

    /// Start the fixed-interval reconciliation loop. The first pass runs
    /// immediately; the returned handle aborts the loop when dropped via
    /// `JoinHandle::abort`.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let summary = self.run_once().await;
                if summary.orders_repaired > 0 || summary.alerts > 0 || summary.errors > 0 {
                    info!(
                        accounts = summary.accounts,
                        repaired = summary.orders_repaired,
                        alerts = summary.alerts,
                        errors = summary.errors,
                        "reconciliation pass completed"
                    );
                } else {
                    debug!(accounts = summary.accounts, "reconciliation pass clean");
                }
            }
        })
    }
}
