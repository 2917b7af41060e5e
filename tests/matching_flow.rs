//! End-to-end matching flows over the in-memory backends: intake validates
//! and enqueues, the engine consumes one job at a time.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use spotmatch::engine::{EngineConfig, MatchingEngine};
use spotmatch::events::{EventBus, MarketEvent};
use spotmatch::idempotency::MemoryGate;
use spotmatch::intake::{CancelError, Intake, SubmitError};
use spotmatch::ledger::{Ledger, MemoryLedger};
use spotmatch::models::{Order, OrderPayload, OrderStatus, OrderType, Side};
use spotmatch::queue::{JobQueue, MemoryQueue};
use spotmatch::Book;

const INSTRUMENT: &str = "BTC-USD";

struct Harness {
    intake: Intake,
    engine: MatchingEngine,
    ledger: Arc<MemoryLedger>,
    queue: Arc<MemoryQueue>,
    book: Arc<Book>,
    events: EventBus,
    key_counter: std::sync::atomic::AtomicU64,
}

impl Harness {
    fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryQueue::new());
        let gate = Arc::new(MemoryGate::new(Duration::from_secs(86_400)));
        let book = Arc::new(Book::new());
        let events = EventBus::new(4096);

        let intake = Intake::new(
            ledger.clone(),
            gate,
            queue.clone(),
            INSTRUMENT.to_string(),
        );
        let engine = MatchingEngine::new(
            book.clone(),
            ledger.clone(),
            events.clone(),
            EngineConfig::default(),
        );

        Self {
            intake,
            engine,
            ledger,
            queue,
            book,
            events,
            key_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn next_key(&self) -> String {
        let n = self
            .key_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("key-{}", n)
    }

    /// Run every queued job through the engine, strictly in order.
    async fn drain(&self) {
        while !self.queue.is_empty() {
            let lease = self.queue.lease().await.unwrap();
            self.engine.process_job(&lease.job).await.unwrap();
            self.queue.ack(lease).await.unwrap();
        }
    }

    async fn place_limit(&self, client: &str, side: Side, price: Decimal, qty: Decimal) -> Order {
        let order = self
            .intake
            .submit(OrderPayload {
                client_id: client.to_string(),
                instrument: INSTRUMENT.to_string(),
                side,
                order_type: OrderType::Limit,
                price: Some(price),
                quantity: qty,
                idempotency_key: self.next_key(),
            })
            .await
            .unwrap();
        self.drain().await;
        order
    }

    async fn place_market(&self, client: &str, side: Side, qty: Decimal) -> Order {
        let order = self
            .intake
            .submit(OrderPayload {
                client_id: client.to_string(),
                instrument: INSTRUMENT.to_string(),
                side,
                order_type: OrderType::Market,
                price: None,
                quantity: qty,
                idempotency_key: self.next_key(),
            })
            .await
            .unwrap();
        self.drain().await;
        order
    }

    async fn cancel(&self, order_id: Uuid) -> Result<Order, CancelError> {
        let result = self.intake.cancel(order_id).await;
        self.drain().await;
        result
    }

    async fn order(&self, id: Uuid) -> Order {
        self.ledger.get_order(id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn partial_fill_leaves_maker_resting() {
    let h = Harness::new();

    let seller = h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.5)).await;
    let buyer = h.place_limit("alice", Side::Buy, dec!(70100), dec!(0.3)).await;

    let trades = h.ledger.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, dec!(70100));
    assert_eq!(trades[0].quantity, dec!(0.3));
    assert_eq!(trades[0].buy_order_id, buyer.id);
    assert_eq!(trades[0].sell_order_id, seller.id);

    let seller = h.order(seller.id).await;
    assert_eq!(seller.status, OrderStatus::PartiallyFilled);
    assert_eq!(seller.remaining(), dec!(0.2));

    let buyer = h.order(buyer.id).await;
    assert_eq!(buyer.status, OrderStatus::Filled);
    assert_eq!(buyer.filled_quantity, dec!(0.3));

    assert_eq!(h.book.best_ask(), Some(dec!(70100)));
    assert_eq!(h.book.level_quantity(Side::Sell, dec!(70100)), dec!(0.2));
}

#[tokio::test]
async fn market_order_sweeps_fifo_across_makers() {
    let h = Harness::new();

    let first = h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.3)).await;
    let second = h.place_limit("carol", Side::Sell, dec!(70100), dec!(0.4)).await;
    let buyer = h.place_market("alice", Side::Buy, dec!(0.5)).await;

    let trades = h.ledger.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 2);
    // Newest first: the second execution hit the younger maker.
    assert_eq!(trades[0].sell_order_id, second.id);
    assert_eq!(trades[0].quantity, dec!(0.2));
    assert_eq!(trades[1].sell_order_id, first.id);
    assert_eq!(trades[1].quantity, dec!(0.3));

    assert_eq!(h.order(first.id).await.status, OrderStatus::Filled);

    let second = h.order(second.id).await;
    assert_eq!(second.status, OrderStatus::PartiallyFilled);
    assert_eq!(second.remaining(), dec!(0.2));

    let buyer = h.order(buyer.id).await;
    assert_eq!(buyer.status, OrderStatus::Filled);
    assert_eq!(buyer.filled_quantity, dec!(0.5));
}

#[tokio::test]
async fn cancel_before_any_fill_empties_level() {
    let h = Harness::new();

    let order = h.place_limit("alice", Side::Buy, dec!(70000), dec!(1.0)).await;
    assert_eq!(h.book.best_bid(), Some(dec!(70000)));

    h.cancel(order.id).await.unwrap();

    let order = h.order(order.id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.filled_quantity, Decimal::ZERO);
    assert_eq!(h.book.best_bid(), None);
    assert_eq!(h.book.order_count(), 0);
}

#[tokio::test]
async fn cancel_after_partial_fill_preserves_accumulated_fill() {
    let h = Harness::new();

    let buyer = h.place_limit("alice", Side::Buy, dec!(70000), dec!(1.0)).await;
    let seller = h.place_market("bob", Side::Sell, dec!(0.4)).await;

    let buyer_mid = h.order(buyer.id).await;
    assert_eq!(buyer_mid.status, OrderStatus::PartiallyFilled);
    assert_eq!(buyer_mid.filled_quantity, dec!(0.4));
    assert_eq!(h.order(seller.id).await.status, OrderStatus::Filled);

    h.cancel(buyer.id).await.unwrap();

    let buyer = h.order(buyer.id).await;
    assert_eq!(buyer.status, OrderStatus::Cancelled);
    assert_eq!(buyer.filled_quantity, dec!(0.4));
    assert_eq!(h.book.best_bid(), None);
}

#[tokio::test]
async fn duplicate_idempotency_key_accepts_exactly_one() {
    let h = Harness::new();

    let payload = OrderPayload {
        client_id: "alice".to_string(),
        instrument: INSTRUMENT.to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        price: Some(dec!(70000)),
        quantity: dec!(1.0),
        idempotency_key: "same-key".to_string(),
    };

    let first = h.intake.submit(payload.clone()).await.unwrap();
    let second = h.intake.submit(payload).await;
    assert!(matches!(second, Err(SubmitError::Duplicate)));
    h.drain().await;

    assert_eq!(h.order(first.id).await.status, OrderStatus::Open);
    assert_eq!(h.ledger.open_limit_orders().await.unwrap().len(), 1);
}

#[tokio::test]
async fn market_against_empty_book_never_rests() {
    let h = Harness::new();

    let order = h.place_market("alice", Side::Buy, dec!(1.0)).await;

    assert!(h.ledger.recent_trades(10).await.unwrap().is_empty());
    let order = h.order(order.id).await;
    // Default policy stamps partially_filled with zero fill.
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled_quantity, Decimal::ZERO);
    assert_eq!(h.book.order_count(), 0);
    assert_eq!(h.book.best_bid(), None);
}

#[tokio::test]
async fn non_crossing_limit_rests_without_trading() {
    let h = Harness::new();

    h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.5)).await;
    let buyer = h.place_limit("alice", Side::Buy, dec!(70000), dec!(0.5)).await;

    assert!(h.ledger.recent_trades(10).await.unwrap().is_empty());
    assert_eq!(h.order(buyer.id).await.status, OrderStatus::Open);

    // Resting book never crosses.
    assert!(h.book.best_bid().unwrap() < h.book.best_ask().unwrap());
}

#[tokio::test]
async fn limit_taker_never_trades_beyond_its_price() {
    let h = Harness::new();

    h.place_limit("bob", Side::Sell, dec!(70050), dec!(0.2)).await;
    h.place_limit("carol", Side::Sell, dec!(70100), dec!(0.2)).await;
    let buyer = h.place_limit("alice", Side::Buy, dec!(70050), dec!(1.0)).await;

    let trades = h.ledger.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert!(trades[0].price <= dec!(70050));

    let buyer = h.order(buyer.id).await;
    assert_eq!(buyer.status, OrderStatus::PartiallyFilled);
    assert_eq!(buyer.filled_quantity, dec!(0.2));
    // The residual rests at the taker's own limit.
    assert_eq!(h.book.best_bid(), Some(dec!(70050)));
    assert_eq!(h.book.level_quantity(Side::Buy, dec!(70050)), dec!(0.8));
}

#[tokio::test]
async fn partial_fill_keeps_maker_time_priority() {
    let h = Harness::new();

    // Maker A rests first and is partially filled.
    let maker_a = h.place_limit("bob", Side::Sell, dec!(70100), dec!(1.0)).await;
    h.place_market("alice", Side::Buy, dec!(0.4)).await;

    // Maker B joins the same level afterwards.
    let maker_b = h.place_limit("carol", Side::Sell, dec!(70100), dec!(1.0)).await;

    // The next taker must hit maker A's remainder first.
    h.place_market("dave", Side::Buy, dec!(0.6)).await;

    let maker_a = h.order(maker_a.id).await;
    assert_eq!(maker_a.status, OrderStatus::Filled);
    assert_eq!(maker_a.filled_quantity, dec!(1.0));

    let maker_b = h.order(maker_b.id).await;
    assert_eq!(maker_b.status, OrderStatus::Open);
    assert_eq!(maker_b.filled_quantity, Decimal::ZERO);
}

#[tokio::test]
async fn cancel_after_complete_fill_is_a_noop() {
    let h = Harness::new();

    let seller = h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.3)).await;
    h.place_market("alice", Side::Buy, dec!(0.3)).await;
    assert_eq!(h.order(seller.id).await.status, OrderStatus::Filled);

    // Intake already refuses terminal cancels.
    let result = h.cancel(seller.id).await;
    assert!(matches!(
        result,
        Err(CancelError::Conflict(OrderStatus::Filled))
    ));
    assert_eq!(h.order(seller.id).await.status, OrderStatus::Filled);
}

#[tokio::test]
async fn fill_vs_cancel_race_is_resolved_by_job_order() {
    let h = Harness::new();

    let seller = h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.3)).await;

    // The fill job is enqueued before the cancel job; the fill wins.
    let buyer = h
        .intake
        .submit(OrderPayload {
            client_id: "alice".to_string(),
            instrument: INSTRUMENT.to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            price: None,
            quantity: dec!(0.3),
            idempotency_key: h.next_key(),
        })
        .await
        .unwrap();
    h.intake.cancel(seller.id).await.unwrap();
    h.drain().await;

    assert_eq!(h.order(seller.id).await.status, OrderStatus::Filled);
    assert_eq!(h.order(buyer.id).await.status, OrderStatus::Filled);
}

#[tokio::test]
async fn detailed_trades_resolve_client_identities() {
    let h = Harness::new();

    h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.5)).await;
    h.place_limit("alice", Side::Buy, dec!(70100), dec!(0.5)).await;

    let detailed = h.ledger.detailed_trades(10).await.unwrap();
    assert_eq!(detailed.len(), 1);
    assert_eq!(detailed[0].buyer_client_id, "alice");
    assert_eq!(detailed[0].seller_client_id, "bob");
    assert_eq!(detailed[0].quantity, dec!(0.5));
}

#[tokio::test]
async fn events_describe_one_trade_step() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();

    let seller = h.place_limit("bob", Side::Sell, dec!(70100), dec!(0.5)).await;
    let buyer = h.place_limit("alice", Side::Buy, dec!(70100), dec!(0.3)).await;

    let mut trades = 0;
    let mut deltas = Vec::new();
    let mut updates = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            MarketEvent::NewTrade { trade } => {
                trades += 1;
                assert_eq!(trade.price, dec!(70100));
                assert_eq!(trade.quantity, dec!(0.3));
            }
            MarketEvent::OrderbookDelta { side, price, quantity } => {
                deltas.push((side, price, quantity));
            }
            MarketEvent::OrderUpdate { order_id, status, filled_quantity } => {
                updates.push((order_id, status, filled_quantity));
            }
        }
    }

    assert_eq!(trades, 1);
    // Seller resting, then the touched level after the match.
    assert!(deltas.contains(&(Side::Sell, dec!(70100), dec!(0.5))));
    assert!(deltas.contains(&(Side::Sell, dec!(70100), dec!(0.2))));
    assert!(updates.contains(&(seller.id, OrderStatus::PartiallyFilled, dec!(0.3))));
    assert!(updates.contains(&(buyer.id, OrderStatus::Filled, dec!(0.3))));
}

#[tokio::test]
async fn conservation_of_filled_quantity() {
    let h = Harness::new();

    let mut ids = Vec::new();
    ids.push(h.place_limit("a", Side::Sell, dec!(70100), dec!(0.7)).await.id);
    ids.push(h.place_limit("b", Side::Sell, dec!(70200), dec!(0.5)).await.id);
    ids.push(h.place_limit("c", Side::Buy, dec!(70150), dec!(1.0)).await.id);
    ids.push(h.place_market("d", Side::Sell, dec!(0.2)).await.id);
    ids.push(h.place_market("e", Side::Buy, dec!(0.6)).await.id);

    let trades = h.ledger.recent_trades(100).await.unwrap();
    for id in ids {
        let order = h.order(id).await;
        let traded: Decimal = trades
            .iter()
            .filter(|t| t.buy_order_id == id || t.sell_order_id == id)
            .map(|t| t.quantity)
            .sum();
        assert_eq!(traded, order.filled_quantity, "conservation for {}", id);
    }
}
