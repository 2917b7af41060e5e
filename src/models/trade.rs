//! Trade model.
//!
//! One row per execution. For every order, the sum of trade quantities
//! referencing it equals the order's `filled_quantity` in the ledger once the
//! matching step that produced the trade has completed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted trade.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub instrument: String,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// A trade joined with the client identities of both parties.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DetailedTrade {
    pub id: Uuid,
    pub instrument: String,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub buyer_client_id: String,
    pub seller_client_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Ledger insert row for a single execution.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub instrument: String,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
}
