//! tpx-oms
//!
//! Order lifecycle management:
//! - [`BrokerGateway`] — the abstract venue capability (submit / cancel /
//!   status / positions) with its failure taxonomy
//! - [`state_machine`] — pure, monotonic order state transitions
//! - [`Order`] — the tracked entity: fill book, retry state, version counter
//! - [`OrderManager`] — idempotent placement, bounded backoff, pending
//!   cancel intents, fill application, reconciliation repair entry point
//!
//! The manager guarantees exactly-once economic effect per
//! `client_order_id`: duplicate placements replay, duplicate fills are
//! no-ops, and submission retries reuse the same idempotency key.

mod gateway;
mod manager;
mod order;
mod retry;

pub mod state_machine;

pub use gateway::{
    with_timeout, BrokerError, BrokerGateway, OrderStatusReport, SubmitAck, SubmitRequest,
    VenueOrderStatus, VenuePosition,
};
pub use manager::{OmsConfig, OmsError, OrderManager, PlaceOrderRequest};
pub use order::{FailureDetail, FailureKind, FillError, Order};
pub use retry::RetryPolicy;
pub use state_machine::{transition, OrderEvent, OrderStatus, TransitionError};
