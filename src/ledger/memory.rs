//! In-memory ledger used by tests and local development.
//!
//! Mirrors the observable semantics of the Postgres adapter (minus
//! durability): generated ids, monotone `updated_at`, value-level idempotent
//! status rewrites, newest-first trade queries.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::{clamp_limit, Ledger, LedgerError};
use crate::models::{
    DetailedTrade, NewOrder, NewTrade, Order, OrderStatus, OrderType, Trade,
};

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    /// Insertion order; doubles as `created_at` ordering.
    order_sequence: Vec<Uuid>,
    trades: Vec<Trade>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_open_order(&self, new: NewOrder) -> Result<Order, LedgerError> {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            client_id: new.client_id,
            instrument: new.instrument,
            side: new.side,
            order_type: new.order_type,
            price: new.price,
            quantity: new.quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock();
        state.order_sequence.push(order.id);
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn create_trade(&self, new: NewTrade) -> Result<Trade, LedgerError> {
        let trade = Trade {
            id: Uuid::new_v4(),
            instrument: new.instrument,
            buy_order_id: new.buy_order_id,
            sell_order_id: new.sell_order_id,
            price: new.price,
            quantity: new.quantity,
            executed_at: Utc::now(),
        };

        self.state.lock().trades.push(trade.clone());
        Ok(trade)
    }

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<Order, LedgerError> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(&id)
            .ok_or(LedgerError::OrderNotFound(id))?;
        order.status = status;
        order.filled_quantity = filled_quantity;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, LedgerError> {
        Ok(self.state.lock().orders.get(&id).cloned())
    }

    async fn open_limit_orders(&self) -> Result<Vec<Order>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .order_sequence
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| {
                o.order_type == OrderType::Limit
                    && matches!(o.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
            })
            .cloned()
            .collect())
    }

    async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .trades
            .iter()
            .rev()
            .take(clamp_limit(limit) as usize)
            .cloned()
            .collect())
    }

    async fn detailed_trades(&self, limit: i64) -> Result<Vec<DetailedTrade>, LedgerError> {
        let state = self.state.lock();
        let mut detailed = Vec::new();
        for trade in state.trades.iter().rev().take(clamp_limit(limit) as usize) {
            let buyer = state
                .orders
                .get(&trade.buy_order_id)
                .ok_or(LedgerError::OrderNotFound(trade.buy_order_id))?;
            let seller = state
                .orders
                .get(&trade.sell_order_id)
                .ok_or(LedgerError::OrderNotFound(trade.sell_order_id))?;
            detailed.push(DetailedTrade {
                id: trade.id,
                instrument: trade.instrument.clone(),
                buy_order_id: trade.buy_order_id,
                sell_order_id: trade.sell_order_id,
                buyer_client_id: buyer.client_id.clone(),
                seller_client_id: seller.client_id.clone(),
                price: trade.price,
                quantity: trade.quantity,
                executed_at: trade.executed_at,
            });
        }
        Ok(detailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn limit_order(side: Side, price: Decimal, quantity: Decimal) -> NewOrder {
        NewOrder {
            client_id: "alice".to_string(),
            instrument: "BTC-USD".to_string(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity,
        }
    }

    #[tokio::test]
    async fn insert_starts_open_with_zero_fill() {
        let ledger = MemoryLedger::new();
        let order = ledger
            .insert_open_order(limit_order(Side::Buy, dec!(70000), dec!(1.0)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.filled_quantity, Decimal::ZERO);

        let fetched = ledger.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, order.id);
    }

    #[tokio::test]
    async fn update_is_value_level_idempotent() {
        let ledger = MemoryLedger::new();
        let order = ledger
            .insert_open_order(limit_order(Side::Sell, dec!(70100), dec!(0.5)))
            .await
            .unwrap();

        let first = ledger
            .update_order_status(order.id, OrderStatus::PartiallyFilled, dec!(0.3))
            .await
            .unwrap();
        let second = ledger
            .update_order_status(order.id, OrderStatus::PartiallyFilled, dec!(0.3))
            .await
            .unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.filled_quantity, second.filled_quantity);
    }

    #[tokio::test]
    async fn update_unknown_order_is_not_found() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .update_order_status(Uuid::new_v4(), OrderStatus::Filled, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn recent_trades_newest_first_and_clamped() {
        let ledger = MemoryLedger::new();
        let buy = ledger
            .insert_open_order(limit_order(Side::Buy, dec!(70000), dec!(3.0)))
            .await
            .unwrap();
        let sell = ledger
            .insert_open_order(limit_order(Side::Sell, dec!(70000), dec!(3.0)))
            .await
            .unwrap();

        for i in 1..=3 {
            ledger
                .create_trade(NewTrade {
                    instrument: "BTC-USD".to_string(),
                    buy_order_id: buy.id,
                    sell_order_id: sell.id,
                    price: dec!(70000),
                    quantity: Decimal::from(i),
                })
                .await
                .unwrap();
        }

        let trades = ledger.recent_trades(2).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].quantity, dec!(3));
        assert_eq!(trades[1].quantity, dec!(2));

        let detailed = ledger.detailed_trades(1).await.unwrap();
        assert_eq!(detailed.len(), 1);
        assert_eq!(detailed[0].buyer_client_id, "alice");
    }

    #[tokio::test]
    async fn open_limit_orders_excludes_terminal_and_market() {
        let ledger = MemoryLedger::new();
        let resting = ledger
            .insert_open_order(limit_order(Side::Buy, dec!(69000), dec!(1.0)))
            .await
            .unwrap();
        let filled = ledger
            .insert_open_order(limit_order(Side::Buy, dec!(69500), dec!(1.0)))
            .await
            .unwrap();
        ledger
            .update_order_status(filled.id, OrderStatus::Filled, dec!(1.0))
            .await
            .unwrap();

        let open = ledger.open_limit_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, resting.id);
    }
}
