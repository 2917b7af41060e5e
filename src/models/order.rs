//! Order model.
//!
//! Order rows are created by intake in `open` state; after insert the
//! matching engine is the sole writer of `status` and `filled_quantity`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_side", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a taker matches against.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(format!("invalid order side: {}", s)),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Rests at its limit price when not fully matched.
    Limit,
    /// Takes whatever the opposite side offers; never rests.
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "limit"),
            OrderType::Market => write!(f, "market"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            _ => Err(format!("invalid order type: {}", s)),
        }
    }
}

/// Order status. Terminal states are monotone: once an order reaches
/// `Filled`, `Cancelled`, or `Rejected` its status never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Resting with no fill.
    Open,
    /// Resting or finished with a partial fill.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled; accumulated fill is preserved.
    Cancelled,
    /// Rejected before taking any liquidity.
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// A persisted order as the ledger sees it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    /// Generated by the ledger on insert.
    pub id: Uuid,

    /// Opaque client identifier.
    pub client_id: String,

    /// Traded instrument, e.g. "BTC-USD".
    pub instrument: String,

    pub side: Side,

    pub order_type: OrderType,

    /// Limit price; absent iff `order_type` is market.
    pub price: Option<Decimal>,

    pub quantity: Decimal,

    /// Cumulative filled quantity, `0 <= filled_quantity <= quantity`.
    pub filled_quantity: Decimal,

    pub status: OrderStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

/// Raw submission payload as received from the external submission surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub client_id: String,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    /// At most one accepted order per key within the gate TTL.
    pub idempotency_key: String,
}

/// A validated submission. Produced by intake; the engine branches on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Limit {
        side: Side,
        price: Decimal,
        quantity: Decimal,
    },
    Market {
        side: Side,
        quantity: Decimal,
    },
}

impl Submission {
    pub fn side(&self) -> Side {
        match self {
            Submission::Limit { side, .. } | Submission::Market { side, .. } => *side,
        }
    }

    pub fn quantity(&self) -> Decimal {
        match self {
            Submission::Limit { quantity, .. } | Submission::Market { quantity, .. } => *quantity,
        }
    }

    pub fn price(&self) -> Option<Decimal> {
        match self {
            Submission::Limit { price, .. } => Some(*price),
            Submission::Market { .. } => None,
        }
    }

    pub fn order_type(&self) -> OrderType {
        match self {
            Submission::Limit { .. } => OrderType::Limit,
            Submission::Market { .. } => OrderType::Market,
        }
    }
}

/// Ledger insert row for a freshly validated submission.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub client_id: String,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
}

impl NewOrder {
    pub fn from_submission(client_id: String, instrument: String, submission: Submission) -> Self {
        Self {
            client_id,
            instrument,
            side: submission.side(),
            order_type: submission.order_type(),
            price: submission.price(),
            quantity: submission.quantity(),
        }
    }
}
