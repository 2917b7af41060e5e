//! Durable order and trade ledger.
//!
//! The ledger is the source of truth. Every operation is durable before it
//! returns; the in-memory book is only a projection that can be rebuilt from
//! `open_limit_orders` after a cache loss.
//!
//! `update_order_status` is idempotent at the value level: writing the same
//! `(status, filled_quantity)` twice is harmless. `create_trade` may produce
//! duplicate rows when a matching step is retried after a partial failure;
//! the engine does not deduplicate at the job level.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{DetailedTrade, NewOrder, NewTrade, Order, OrderStatus, Trade};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Upper bound applied to trade history queries regardless of the caller.
pub const MAX_TRADE_QUERY: i64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),
}

/// Contract of the durable store (C1).
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a validated submission with `status = open` and
    /// `filled_quantity = 0`. The store generates the order id.
    async fn insert_open_order(&self, new: NewOrder) -> Result<Order, LedgerError>;

    /// Record one execution.
    async fn create_trade(&self, new: NewTrade) -> Result<Trade, LedgerError>;

    /// Rewrite an order's status and cumulative fill.
    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<Order, LedgerError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, LedgerError>;

    /// Resting candidates for book recovery: open or partially filled limit
    /// orders, oldest first.
    async fn open_limit_orders(&self) -> Result<Vec<Order>, LedgerError>;

    /// Most recent trades, newest first. `limit` is clamped to
    /// [`MAX_TRADE_QUERY`].
    async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>, LedgerError>;

    /// Most recent trades joined with buyer/seller client identities.
    async fn detailed_trades(&self, limit: i64) -> Result<Vec<DetailedTrade>, LedgerError>;
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_TRADE_QUERY)
}
