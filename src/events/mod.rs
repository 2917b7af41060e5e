//! Broadcast event stream emitted by the matching loop.
//!
//! Delivery is at-most-once per subscriber: slow subscribers observe lag and
//! missed events rather than backpressuring the matcher.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{OrderStatus, Side, Trade};

/// Structured records published by the matcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    NewTrade {
        trade: Trade,
    },
    OrderUpdate {
        order_id: Uuid,
        status: OrderStatus,
        filled_quantity: Decimal,
    },
    /// `quantity` is the new aggregate at the touched price; zero signals
    /// level removal.
    OrderbookDelta {
        side: Side,
        price: Decimal,
        quantity: Decimal,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MarketEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.sender.subscribe()
    }

    /// Send errors only mean there is no subscriber; the matcher never blocks
    /// on fan-out.
    pub fn publish(&self, event: MarketEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}
