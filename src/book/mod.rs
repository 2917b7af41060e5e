//! In-memory price-time-priority order book.
//!
//! Each side is an ordered map from a scaled price tick to a FIFO queue of
//! resting order ids; resting state lives in a separate order map. The book
//! is a projection of the ledger, not a source of truth: on loss it is
//! rebuilt from the ledger's open limit orders before the matcher serves
//! jobs.
//!
//! A price is present in a side's index if and only if its queue is
//! non-empty. Orphans (an empty queue left in the index, or a queued id
//! missing from the order map) are cleaned defensively with a warning and
//! never abort a match.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

use crate::models::Side;

/// Price index key with 8 decimal digits of precision for exact comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceTick(i64);

const TICK_SCALE: i64 = 100_000_000;

impl PriceTick {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = price * Decimal::from(TICK_SCALE);
        let truncated = scaled.trunc();
        let value = truncated.mantissa() / 10i128.pow(truncated.scale());
        PriceTick(value as i64)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(TICK_SCALE)
    }
}

impl Ord for PriceTick {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceTick {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// State of one resting order in the order map.
#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub client_id: String,
    pub side: Side,
    pub price: Decimal,
    /// Unfilled quantity still claimable by takers; always > 0 while resting.
    pub remaining: Decimal,
    /// Cumulative filled quantity across the order's lifetime.
    pub filled_total: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One aggregated level of a book snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    /// Running sum within the returned window.
    pub cumulative: Decimal,
}

/// Read view of both sides: asks ascending, bids descending, empty levels
/// filtered.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

pub struct Book {
    bids: RwLock<BTreeMap<PriceTick, VecDeque<Uuid>>>,
    asks: RwLock<BTreeMap<PriceTick, VecDeque<Uuid>>>,
    orders: DashMap<Uuid, RestingOrder>,
}

impl Book {
    pub fn new() -> Self {
        Self {
            bids: RwLock::new(BTreeMap::new()),
            asks: RwLock::new(BTreeMap::new()),
            orders: DashMap::new(),
        }
    }

    fn side_index(&self, side: Side) -> &RwLock<BTreeMap<PriceTick, VecDeque<Uuid>>> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Best price a taker on `taker_side` can match against: the lowest ask
    /// for a buyer, the highest bid for a seller.
    pub fn best_opposite(&self, taker_side: Side) -> Option<Decimal> {
        match taker_side {
            Side::Buy => self.best_ask(),
            Side::Sell => self.best_bid(),
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.read().keys().next_back().map(|t| t.to_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.read().keys().next().map(|t| t.to_decimal())
    }

    /// Remove and return the FIFO head at `(side, price)`. The price is
    /// dropped from the index when its queue empties, including the orphan
    /// case where an empty queue was left behind.
    pub fn pop_oldest_at(&self, side: Side, price: Decimal) -> Option<Uuid> {
        let tick = PriceTick::from_decimal(price);
        let mut index = self.side_index(side).write();
        let queue = index.get_mut(&tick)?;
        let popped = queue.pop_front();
        if popped.is_none() {
            tracing::warn!(%side, %price, "removing orphaned empty price level");
        }
        if queue.is_empty() {
            index.remove(&tick);
        }
        popped
    }

    /// Restore an order to the head of its level, preserving time priority.
    /// Used when a partial fill leaves the maker with quantity remaining.
    pub fn push_front_at(&self, side: Side, price: Decimal, order_id: Uuid) {
        let tick = PriceTick::from_decimal(price);
        self.side_index(side)
            .write()
            .entry(tick)
            .or_default()
            .push_front(order_id);
    }

    /// Add a new resting order at the tail of its level.
    pub fn append_at(&self, side: Side, price: Decimal, order_id: Uuid, state: RestingOrder) {
        let tick = PriceTick::from_decimal(price);
        self.orders.insert(order_id, state);
        self.side_index(side)
            .write()
            .entry(tick)
            .or_default()
            .push_back(order_id);
    }

    /// Rewrite the order-map entry of a resting order.
    pub fn insert_resting(&self, order_id: Uuid, state: RestingOrder) {
        self.orders.insert(order_id, state);
    }

    /// Drop only the order-map entry. Used for makers that were already
    /// popped from their level.
    pub fn forget(&self, order_id: Uuid) -> Option<RestingOrder> {
        self.orders.remove(&order_id).map(|(_, state)| state)
    }

    /// Cancellation path: remove the order from its level by identity and
    /// from the order map, returning the stored state. The price is dropped
    /// from the index when the level empties.
    pub fn remove(&self, order_id: Uuid) -> Option<RestingOrder> {
        let (_, state) = self.orders.remove(&order_id)?;
        let tick = PriceTick::from_decimal(state.price);
        let mut index = self.side_index(state.side).write();
        match index.get_mut(&tick) {
            Some(queue) => {
                if let Some(pos) = queue.iter().position(|id| *id == order_id) {
                    queue.remove(pos);
                } else {
                    tracing::warn!(%order_id, "resting order missing from its price level");
                }
                if queue.is_empty() {
                    index.remove(&tick);
                }
            }
            None => {
                tracing::warn!(%order_id, price = %state.price, "price level missing for resting order");
            }
        }
        Some(state)
    }

    pub fn fetch(&self, order_id: Uuid) -> Option<RestingOrder> {
        self.orders.get(&order_id).map(|entry| entry.value().clone())
    }

    /// Aggregate remaining quantity at `(side, price)`; zero when the level
    /// is absent. Queued ids missing from the order map contribute nothing.
    pub fn level_quantity(&self, side: Side, price: Decimal) -> Decimal {
        let tick = PriceTick::from_decimal(price);
        let index = self.side_index(side).read();
        index
            .get(&tick)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|id| self.orders.get(id).map(|o| o.remaining))
                    .sum()
            })
            .unwrap_or(Decimal::ZERO)
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Top-of-book view, `depth` levels per side.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let mut bids = Vec::new();
        {
            let index = self.bids.read();
            let mut cumulative = Decimal::ZERO;
            for (tick, queue) in index.iter().rev() {
                if bids.len() == depth {
                    break;
                }
                let quantity: Decimal = queue
                    .iter()
                    .filter_map(|id| self.orders.get(id).map(|o| o.remaining))
                    .sum();
                if quantity <= Decimal::ZERO {
                    continue;
                }
                cumulative += quantity;
                bids.push(BookLevel {
                    price: tick.to_decimal(),
                    quantity,
                    cumulative,
                });
            }
        }

        let mut asks = Vec::new();
        {
            let index = self.asks.read();
            let mut cumulative = Decimal::ZERO;
            for (tick, queue) in index.iter() {
                if asks.len() == depth {
                    break;
                }
                let quantity: Decimal = queue
                    .iter()
                    .filter_map(|id| self.orders.get(id).map(|o| o.remaining))
                    .sum();
                if quantity <= Decimal::ZERO {
                    continue;
                }
                cumulative += quantity;
                asks.push(BookLevel {
                    price: tick.to_decimal(),
                    quantity,
                    cumulative,
                });
            }
        }

        BookSnapshot { bids, asks }
    }
}

impl Default for Book {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn resting(side: Side, price: Decimal, remaining: Decimal) -> RestingOrder {
        RestingOrder {
            client_id: "client".to_string(),
            side,
            price,
            remaining,
            filled_total: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn price_tick_round_trips() {
        let price = dec!(70100.12345678);
        let tick = PriceTick::from_decimal(price);
        assert_eq!(tick.to_decimal(), price);
    }

    #[test]
    fn best_prices_per_side() {
        let book = Book::new();
        book.append_at(Side::Buy, dec!(70000), Uuid::new_v4(), resting(Side::Buy, dec!(70000), dec!(1)));
        book.append_at(Side::Buy, dec!(69900), Uuid::new_v4(), resting(Side::Buy, dec!(69900), dec!(1)));
        book.append_at(Side::Sell, dec!(70100), Uuid::new_v4(), resting(Side::Sell, dec!(70100), dec!(1)));
        book.append_at(Side::Sell, dec!(70200), Uuid::new_v4(), resting(Side::Sell, dec!(70200), dec!(1)));

        assert_eq!(book.best_bid(), Some(dec!(70000)));
        assert_eq!(book.best_ask(), Some(dec!(70100)));
        assert_eq!(book.best_opposite(Side::Buy), Some(dec!(70100)));
        assert_eq!(book.best_opposite(Side::Sell), Some(dec!(70000)));
    }

    #[test]
    fn pop_is_fifo_and_cleans_emptied_level() {
        let book = Book::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        book.append_at(Side::Sell, dec!(70100), first, resting(Side::Sell, dec!(70100), dec!(0.3)));
        book.append_at(Side::Sell, dec!(70100), second, resting(Side::Sell, dec!(70100), dec!(0.4)));

        assert_eq!(book.pop_oldest_at(Side::Sell, dec!(70100)), Some(first));
        assert_eq!(book.pop_oldest_at(Side::Sell, dec!(70100)), Some(second));
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.pop_oldest_at(Side::Sell, dec!(70100)), None);
    }

    #[test]
    fn push_front_restores_time_priority() {
        let book = Book::new();
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();
        book.append_at(Side::Buy, dec!(70000), older, resting(Side::Buy, dec!(70000), dec!(1)));
        book.append_at(Side::Buy, dec!(70000), newer, resting(Side::Buy, dec!(70000), dec!(1)));

        let popped = book.pop_oldest_at(Side::Buy, dec!(70000)).unwrap();
        assert_eq!(popped, older);
        book.push_front_at(Side::Buy, dec!(70000), older);

        assert_eq!(book.pop_oldest_at(Side::Buy, dec!(70000)), Some(older));
        assert_eq!(book.pop_oldest_at(Side::Buy, dec!(70000)), Some(newer));
    }

    #[test]
    fn remove_by_identity_keeps_peers_and_cleans_level() {
        let book = Book::new();
        let kept = Uuid::new_v4();
        let removed = Uuid::new_v4();
        book.append_at(Side::Buy, dec!(70000), kept, resting(Side::Buy, dec!(70000), dec!(1)));
        book.append_at(Side::Buy, dec!(70000), removed, resting(Side::Buy, dec!(70000), dec!(2)));

        let state = book.remove(removed).unwrap();
        assert_eq!(state.remaining, dec!(2));
        assert_eq!(book.level_quantity(Side::Buy, dec!(70000)), dec!(1));
        assert_eq!(book.pop_oldest_at(Side::Buy, dec!(70000)), Some(kept));
        assert_eq!(book.best_bid(), None);

        assert!(book.remove(removed).is_none());
    }

    #[test]
    fn orphaned_empty_level_is_cleaned_on_pop() {
        let book = Book::new();
        book.asks
            .write()
            .insert(PriceTick::from_decimal(dec!(70100)), VecDeque::new());

        assert_eq!(book.best_ask(), Some(dec!(70100)));
        assert_eq!(book.pop_oldest_at(Side::Sell, dec!(70100)), None);
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn orphaned_id_contributes_nothing_to_aggregates() {
        let book = Book::new();
        let order_id = Uuid::new_v4();
        book.append_at(Side::Sell, dec!(70100), order_id, resting(Side::Sell, dec!(70100), dec!(1)));
        book.forget(order_id);

        assert_eq!(book.level_quantity(Side::Sell, dec!(70100)), Decimal::ZERO);
        let snapshot = book.snapshot(10);
        assert!(snapshot.asks.is_empty());
    }

    #[test]
    fn snapshot_orders_sides_and_accumulates() {
        let book = Book::new();
        book.append_at(Side::Buy, dec!(70000), Uuid::new_v4(), resting(Side::Buy, dec!(70000), dec!(1.0)));
        book.append_at(Side::Buy, dec!(69900), Uuid::new_v4(), resting(Side::Buy, dec!(69900), dec!(2.0)));
        book.append_at(Side::Buy, dec!(69800), Uuid::new_v4(), resting(Side::Buy, dec!(69800), dec!(3.0)));
        book.append_at(Side::Sell, dec!(70100), Uuid::new_v4(), resting(Side::Sell, dec!(70100), dec!(0.5)));
        book.append_at(Side::Sell, dec!(70100), Uuid::new_v4(), resting(Side::Sell, dec!(70100), dec!(0.5)));
        book.append_at(Side::Sell, dec!(70300), Uuid::new_v4(), resting(Side::Sell, dec!(70300), dec!(2.0)));

        let snapshot = book.snapshot(2);

        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(snapshot.bids[0].price, dec!(70000));
        assert_eq!(snapshot.bids[1].price, dec!(69900));
        assert_eq!(snapshot.bids[1].cumulative, dec!(3.0));

        assert_eq!(snapshot.asks.len(), 2);
        assert_eq!(snapshot.asks[0].price, dec!(70100));
        assert_eq!(snapshot.asks[0].quantity, dec!(1.0));
        assert_eq!(snapshot.asks[1].price, dec!(70300));
        assert_eq!(snapshot.asks[1].cumulative, dec!(3.0));
    }
}
