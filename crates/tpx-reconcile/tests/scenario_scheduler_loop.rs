//! The background loop repairs drift on its own within an interval, while
//! live placement keeps working alongside it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tpx_broker_paper::PaperVenue;
use tpx_ledger::PositionLedger;
use tpx_oms::{OmsConfig, OrderManager, OrderStatus, PlaceOrderRequest, RetryPolicy};
use tpx_reconcile::{ReconcileConfig, ReconciliationScheduler};
use tpx_schemas::{OrderType, Side};

#[tokio::test]
async fn scenario_background_loop_repairs_drift() {
    let venue = Arc::new(PaperVenue::new());
    let config = OmsConfig {
        known_accounts: BTreeSet::from(["acct-1".to_string()]),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            jitter_ms: 0,
        },
        broker_call_timeout_ms: 1_000,
    };
    let manager = Arc::new(OrderManager::new(
        Arc::clone(&venue),
        Arc::new(PositionLedger::new()),
        config,
    ));
    let scheduler = Arc::new(ReconciliationScheduler::new(
        Arc::clone(&manager),
        ReconcileConfig {
            interval_ms: 20,
            ..ReconcileConfig::default()
        },
    ));

    let order = manager
        .place_order(PlaceOrderRequest {
            client_order_id: Some("A1".to_string()),
            account_id: "acct-1".to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: 40,
            limit_price_micros: None,
        })
        .await
        .unwrap();

    let handle = Arc::clone(&scheduler).start();

    // Venue fills the order; the engine never hears the notification.
    venue.push_fill("A1", 40, 50_000_000).await;

    // Placement keeps working while the loop runs.
    manager
        .place_order(PlaceOrderRequest {
            client_order_id: Some("A2".to_string()),
            account_id: "acct-1".to_string(),
            symbol: "MSFT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: 5,
            limit_price_micros: None,
        })
        .await
        .unwrap();

    // Give the loop a few intervals to notice and repair.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = manager.get_order(order.order_id).await.unwrap();
        if current.status == OrderStatus::Filled {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "scheduler never repaired the missed fill"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let pos = manager.ledger().position("acct-1", "AAPL").await.unwrap();
    assert_eq!(pos.net_qty, 40);

    handle.abort();
}
