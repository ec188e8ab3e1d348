//! tpx-reconcile
//!
//! Continuous audit of local order/position state against venue truth:
//! - [`drift`] — pure comparison logic (order repair classification,
//!   position diffs under tolerance)
//! - [`ReconciliationAlert`] / [`AlertBus`] — reported drift, broadcast to
//!   subscribers, never silently corrected
//! - [`ReconciliationScheduler`] — fixed-interval passes that repair order
//!   drift through the normal fill path and alert on position drift
//!
//! Reconciliation converges state toward broker truth but never decreases
//! recorded progress.

pub mod drift;

mod alert;
mod scheduler;

pub use alert::{AlertBus, ReconciliationAlert};
pub use drift::{order_drift, position_diffs, OrderDrift, PositionDiff};
pub use scheduler::{ReconcileConfig, ReconcileSummary, ReconciliationScheduler};
