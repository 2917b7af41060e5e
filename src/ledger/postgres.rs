//! Postgres ledger: a thin SQL adapter over the orders and trades tables.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::{clamp_limit, Ledger, LedgerError};
use crate::models::{DetailedTrade, NewOrder, NewTrade, Order, OrderStatus, Trade};

const ORDER_COLUMNS: &str = "id, client_id, instrument, side, order_type, price, quantity, \
                             filled_quantity, status, created_at, updated_at";

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_open_order(&self, new: NewOrder) -> Result<Order, LedgerError> {
        let order: Order = sqlx::query_as(&format!(
            r#"
            INSERT INTO orders (client_id, instrument, side, order_type, price, quantity)
            VALUES ($1, $2, $3::order_side, $4::order_type, $5, $6)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&new.client_id)
        .bind(&new.instrument)
        .bind(new.side.to_string())
        .bind(new.order_type.to_string())
        .bind(new.price)
        .bind(new.quantity)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(order_id = %order.id, "inserted open order");
        Ok(order)
    }

    async fn create_trade(&self, new: NewTrade) -> Result<Trade, LedgerError> {
        let trade: Trade = sqlx::query_as(
            r#"
            INSERT INTO trades (instrument, buy_order_id, sell_order_id, price, quantity)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, instrument, buy_order_id, sell_order_id, price, quantity, executed_at
            "#,
        )
        .bind(&new.instrument)
        .bind(new.buy_order_id)
        .bind(new.sell_order_id)
        .bind(new.price)
        .bind(new.quantity)
        .fetch_one(&self.pool)
        .await?;

        Ok(trade)
    }

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<Order, LedgerError> {
        let order: Option<Order> = sqlx::query_as(&format!(
            r#"
            UPDATE orders
            SET status = $2::order_status, filled_quantity = $3, updated_at = now()
            WHERE id = $1
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.to_string())
        .bind(filled_quantity)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or(LedgerError::OrderNotFound(id))
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, LedgerError> {
        let order: Option<Order> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn open_limit_orders(&self) -> Result<Vec<Order>, LedgerError> {
        let orders: Vec<Order> = sqlx::query_as(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE status IN ('open', 'partially_filled') AND order_type = 'limit'
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>, LedgerError> {
        let trades: Vec<Trade> = sqlx::query_as(
            r#"
            SELECT id, instrument, buy_order_id, sell_order_id, price, quantity, executed_at
            FROM trades
            ORDER BY executed_at DESC
            LIMIT $1
            "#,
        )
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(trades)
    }

    async fn detailed_trades(&self, limit: i64) -> Result<Vec<DetailedTrade>, LedgerError> {
        let trades: Vec<DetailedTrade> = sqlx::query_as(
            r#"
            SELECT t.id, t.instrument, t.buy_order_id, t.sell_order_id,
                   b.client_id AS buyer_client_id, s.client_id AS seller_client_id,
                   t.price, t.quantity, t.executed_at
            FROM trades t
            JOIN orders b ON b.id = t.buy_order_id
            JOIN orders s ON s.id = t.sell_order_id
            ORDER BY t.executed_at DESC
            LIMIT $1
            "#,
        )
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(trades)
    }
}
