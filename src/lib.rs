//! # spotmatch
//!
//! Core of a single-instrument limit-order-book matching engine for a spot
//! exchange: a serialized matching state machine over a durable order and
//! trade ledger, an in-memory price-time-priority book, an idempotency-gated
//! intake, and a broadcast event stream.
//!
//! ## Architecture
//!
//! ```text
//! submission
//!   ↓
//! Intake ──claim──→ IdempotencyGate (Redis, fail-closed)
//!   ├──insert open──→ Ledger (Postgres, source of truth)
//!   └──enqueue──→ JobQueue (durable FIFO)
//!                    ↓ one job at a time
//!               MatchingEngine
//!                    ├──trades / status──→ Ledger
//!                    ├──mutations──→ Book (in-memory projection)
//!                    └──events──→ EventBus (broadcast)
//! ```
//!
//! The matcher is the sole writer of order status and fill after insert;
//! readers of the book obtain snapshots and tolerate transient states
//! between sub-steps.

pub mod book;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod idempotency;
pub mod intake;
pub mod ledger;
pub mod models;
pub mod queue;

pub use book::{Book, BookLevel, BookSnapshot, RestingOrder};
pub use engine::{EngineConfig, EngineError, MatchingEngine, UnfilledMarketPolicy};
pub use events::{EventBus, MarketEvent};
pub use idempotency::{Claim, IdempotencyGate, MemoryGate, RedisGate};
pub use intake::{CancelError, Intake, SubmitError};
pub use ledger::{Ledger, LedgerError, MemoryLedger, PgLedger};
pub use models::{Order, OrderPayload, OrderStatus, OrderType, Side, Submission, Trade};
pub use queue::{Job, JobQueue, MemoryQueue, RedisQueue};
