//! Serialized matching engine.
//!
//! A single consumer drains the durable job stream with effective
//! concurrency 1: for any two jobs J1 enqueued before J2, every side effect
//! of J1 on ledger, book, and broadcast happens before any side effect of
//! J2. Suspension points occur only at I/O boundaries; the book is never
//! left mid-step in a state where it disagrees with the ledger about a maker
//! that still has claimable quantity.
//!
//! Within one trade step the update order is: durable trade, maker ledger
//! update, maker book mutation, taker update, level cleanup, events. A
//! failed ledger write restores the maker to the head of its level and fails
//! the step; the job is then retried, resuming the taker's cumulative fill
//! from the ledger. Retries can duplicate trade rows for the failed
//! iteration; the engine does not deduplicate at the job level.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::book::{Book, RestingOrder};
use crate::events::{EventBus, MarketEvent};
use crate::ledger::{Ledger, LedgerError};
use crate::models::{NewTrade, Order, OrderStatus, OrderType, Side};
use crate::queue::{Job, JobQueue};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);

/// Terminal status stamped on a market order that found no liquidity at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnfilledMarketPolicy {
    /// Stamp `partially_filled` with zero fill, mirroring the historical
    /// behavior of the platform.
    #[default]
    PartialFill,
    /// Stamp `rejected`.
    Reject,
}

impl std::str::FromStr for UnfilledMarketPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "partial_fill" => Ok(UnfilledMarketPolicy::PartialFill),
            "reject" => Ok(UnfilledMarketPolicy::Reject),
            _ => Err(format!("invalid unfilled market policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Tolerance below which a remaining quantity counts as exhausted.
    /// Zero is correct for exact fixed-point arithmetic.
    pub match_epsilon: Decimal,
    pub unfilled_market_policy: UnfilledMarketPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ledger fault: {0}")]
    Storage(#[from] LedgerError),

    /// Internal consistency violation. Aborts the step and surfaces for
    /// out-of-band investigation; never silently clamped.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub struct MatchingEngine {
    book: Arc<Book>,
    ledger: Arc<dyn Ledger>,
    events: EventBus,
    epsilon: Decimal,
    market_policy: UnfilledMarketPolicy,
}

/// Normalize a fixed-point field to 8 fractional digits.
fn fixed8(value: Decimal) -> Decimal {
    value.round_dp(8)
}

impl MatchingEngine {
    pub fn new(
        book: Arc<Book>,
        ledger: Arc<dyn Ledger>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            book,
            ledger,
            events,
            epsilon: config.match_epsilon,
            market_policy: config.unfilled_market_policy,
        }
    }

    pub fn book(&self) -> &Arc<Book> {
        &self.book
    }

    /// Rebuild the book projection from the ledger's resting limit orders.
    /// Must run before the consumer starts accepting jobs after a cache
    /// loss; without it the book would silently desynchronize.
    pub async fn recover_book(&self) -> Result<usize, EngineError> {
        let orders = self.ledger.open_limit_orders().await?;
        let mut restored = 0;
        for order in orders {
            let Some(price) = order.price else {
                warn!(order_id = %order.id, "resting order without a price, skipping");
                continue;
            };
            let remaining = fixed8(order.remaining());
            if remaining <= self.epsilon {
                warn!(order_id = %order.id, "resting order with nothing remaining, skipping");
                continue;
            }
            let price = fixed8(price);
            self.book.append_at(
                order.side,
                price,
                order.id,
                RestingOrder {
                    client_id: order.client_id.clone(),
                    side: order.side,
                    price,
                    remaining,
                    filled_total: fixed8(order.filled_quantity),
                    created_at: order.created_at,
                },
            );
            restored += 1;
        }
        info!(restored, "order book recovered from ledger");
        Ok(restored)
    }

    /// Consume jobs forever, strictly in enqueue order, one at a time.
    pub async fn run(&self, queue: Arc<dyn JobQueue>) {
        info!("matching engine consuming jobs");
        loop {
            let lease = match queue.lease().await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(error = %e, "job lease failed, retrying");
                    tokio::time::sleep(RETRY_BASE).await;
                    continue;
                }
            };

            self.process_with_retry(&lease.job).await;

            if let Err(e) = queue.ack(lease).await {
                warn!(error = %e, "job acknowledge failed; job may be redelivered after restart");
            }
        }
    }

    /// Ledger faults are fatal to the step and retried with backoff until
    /// the step completes; invariant violations abort the job.
    async fn process_with_retry(&self, job: &Job) {
        let mut backoff = RETRY_BASE;
        loop {
            match self.process_job(job).await {
                Ok(()) => return,
                Err(EngineError::Invariant(msg)) => {
                    error!(%msg, "aborting job after invariant violation");
                    return;
                }
                Err(EngineError::Storage(e)) => {
                    warn!(error = %e, "ledger fault during matching step, retrying job");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
            }
        }
    }

    /// Run one job to completion. Deterministic entry point for the
    /// consumer loop, replay tooling, and tests.
    pub async fn process_job(&self, job: &Job) -> Result<(), EngineError> {
        match job {
            Job::Submit { order } => self.process_submit(order).await,
            Job::Cancel { order_id } => self.process_cancel(*order_id).await,
        }
    }

    async fn process_submit(&self, snapshot: &Order) -> Result<(), EngineError> {
        // The ledger row is authoritative: a job redelivered after a crash
        // resumes from the cumulative fill that already landed.
        let order = self
            .ledger
            .get_order(snapshot.id)
            .await?
            .ok_or_else(|| {
                EngineError::Invariant(format!("submit job for unknown order {}", snapshot.id))
            })?;
        if order.status.is_terminal() {
            warn!(order_id = %order.id, status = %order.status, "ignoring submit job for terminal order");
            return Ok(());
        }

        let side = order.side;
        let opposite = side.opposite();
        let quantity = fixed8(order.quantity);
        let limit_price = match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => Some(fixed8(price)),
            (OrderType::Limit, None) => {
                return Err(EngineError::Invariant(format!(
                    "limit order {} without price",
                    order.id
                )))
            }
            (OrderType::Market, _) => None,
        };
        let mut filled = fixed8(order.filled_quantity);

        loop {
            let remaining = quantity - filled;
            if remaining <= self.epsilon {
                break;
            }

            let Some(best) = self.book.best_opposite(side) else {
                break;
            };
            if let Some(limit) = limit_price {
                let crossable = match side {
                    Side::Buy => limit >= best,
                    Side::Sell => limit <= best,
                };
                if !crossable {
                    break;
                }
            }

            // The book cleans orphaned empty levels itself; just move on.
            let Some(maker_id) = self.book.pop_oldest_at(opposite, best) else {
                continue;
            };
            let Some(maker) = self.book.fetch(maker_id) else {
                warn!(order_id = %maker_id, "queued maker missing from order map, skipping");
                continue;
            };

            let trade_qty = remaining.min(maker.remaining);
            if trade_qty <= self.epsilon {
                warn!(order_id = %maker_id, remaining = %maker.remaining, "dropping resting order with no claimable quantity");
                self.book.forget(maker_id);
                continue;
            }
            if filled + trade_qty > quantity {
                return Err(EngineError::Invariant(format!(
                    "taker {} fill {} would exceed quantity {}",
                    order.id,
                    filled + trade_qty,
                    quantity
                )));
            }

            let maker_remaining = maker.remaining - trade_qty;
            let maker_filled = maker.filled_total + trade_qty;

            // The trade must be durable before the maker's book state
            // changes. On failure, restore the maker's queue slot so the
            // retried step sees the book it started with.
            let (buy_order_id, sell_order_id) = match side {
                Side::Buy => (order.id, maker_id),
                Side::Sell => (maker_id, order.id),
            };
            let trade = match self
                .ledger
                .create_trade(NewTrade {
                    instrument: order.instrument.clone(),
                    buy_order_id,
                    sell_order_id,
                    price: best,
                    quantity: trade_qty,
                })
                .await
            {
                Ok(trade) => trade,
                Err(e) => {
                    self.book.push_front_at(opposite, best, maker_id);
                    return Err(e.into());
                }
            };

            let maker_done = maker_remaining <= self.epsilon;
            let maker_status = if maker_done {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            if let Err(e) = self
                .ledger
                .update_order_status(maker_id, maker_status, maker_filled)
                .await
            {
                self.book.push_front_at(opposite, best, maker_id);
                return Err(e.into());
            }

            if maker_done {
                self.book.forget(maker_id);
            } else {
                // Reinsert at the front of the level: a partial fill does
                // not cost the maker its time priority.
                self.book.insert_resting(
                    maker_id,
                    RestingOrder {
                        remaining: maker_remaining,
                        filled_total: maker_filled,
                        ..maker
                    },
                );
                self.book.push_front_at(opposite, best, maker_id);
            }

            filled += trade_qty;
            let taker_remaining = quantity - filled;
            let taker_status = if taker_remaining <= self.epsilon {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            if taker_remaining > self.epsilon {
                // Keep the taker's cumulative fill current while the loop is
                // still running; the final status lands after the loop.
                self.ledger
                    .update_order_status(order.id, OrderStatus::PartiallyFilled, filled)
                    .await?;
            }

            debug!(trade_id = %trade.id, price = %best, quantity = %trade_qty, "matched");

            self.events.publish(MarketEvent::NewTrade { trade });
            self.events.publish(MarketEvent::OrderbookDelta {
                side: opposite,
                price: best,
                quantity: self.book.level_quantity(opposite, best),
            });
            self.events.publish(MarketEvent::OrderUpdate {
                order_id: maker_id,
                status: maker_status,
                filled_quantity: maker_filled,
            });
            self.events.publish(MarketEvent::OrderUpdate {
                order_id: order.id,
                status: taker_status,
                filled_quantity: filled,
            });
        }

        let remaining = quantity - filled;
        match order.order_type {
            OrderType::Market => {
                // Market orders never rest on the book.
                let status = if remaining <= self.epsilon {
                    OrderStatus::Filled
                } else if filled > self.epsilon {
                    OrderStatus::PartiallyFilled
                } else {
                    match self.market_policy {
                        UnfilledMarketPolicy::PartialFill => OrderStatus::PartiallyFilled,
                        UnfilledMarketPolicy::Reject => OrderStatus::Rejected,
                    }
                };
                self.ledger
                    .update_order_status(order.id, status, filled)
                    .await?;
                self.events.publish(MarketEvent::OrderUpdate {
                    order_id: order.id,
                    status,
                    filled_quantity: filled,
                });
            }
            OrderType::Limit => {
                if remaining > self.epsilon {
                    let Some(price) = limit_price else {
                        return Err(EngineError::Invariant(format!(
                            "limit order {} without price",
                            order.id
                        )));
                    };
                    let status = if filled > self.epsilon {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Open
                    };
                    // Ledger first: a fault here retries the job with the
                    // residual not yet resting, so nothing is duplicated.
                    self.ledger
                        .update_order_status(order.id, status, filled)
                        .await?;
                    self.book.append_at(
                        side,
                        price,
                        order.id,
                        RestingOrder {
                            client_id: order.client_id.clone(),
                            side,
                            price,
                            remaining,
                            filled_total: filled,
                            created_at: order.created_at,
                        },
                    );
                    self.events.publish(MarketEvent::OrderbookDelta {
                        side,
                        price,
                        quantity: self.book.level_quantity(side, price),
                    });
                    self.events.publish(MarketEvent::OrderUpdate {
                        order_id: order.id,
                        status,
                        filled_quantity: filled,
                    });
                } else {
                    self.ledger
                        .update_order_status(order.id, OrderStatus::Filled, filled)
                        .await?;
                    self.events.publish(MarketEvent::OrderUpdate {
                        order_id: order.id,
                        status: OrderStatus::Filled,
                        filled_quantity: filled,
                    });
                }
            }
        }

        Ok(())
    }

    async fn process_cancel(&self, order_id: Uuid) -> Result<(), EngineError> {
        if self.book.fetch(order_id).is_none() {
            // Fully filled (or already cancelled) by an earlier job; the
            // ledger already reflects the terminal state.
            debug!(%order_id, "cancel no-op; order is no longer resting");
            return Ok(());
        }

        // Side and price come from the ledger, which is authoritative.
        let order = self.ledger.get_order(order_id).await?.ok_or_else(|| {
            EngineError::Invariant(format!("cancel job for order {} missing from ledger", order_id))
        })?;

        if order.status.is_terminal() {
            warn!(%order_id, status = %order.status, "terminal order still resting in book, removing");
            self.book.remove(order_id);
            return Ok(());
        }

        let Some(price) = order.price else {
            return Err(EngineError::Invariant(format!(
                "resting order {} has no price",
                order_id
            )));
        };

        // Ledger first: a storage fault retries the job with the book
        // untouched. The removal that follows cannot fail.
        self.ledger
            .update_order_status(order_id, OrderStatus::Cancelled, order.filled_quantity)
            .await?;
        if self.book.remove(order_id).is_none() {
            warn!(%order_id, "resting order vanished while cancelling");
        }

        info!(%order_id, filled = %order.filled_quantity, "order cancelled");

        self.events.publish(MarketEvent::OrderUpdate {
            order_id,
            status: OrderStatus::Cancelled,
            filled_quantity: order.filled_quantity,
        });
        self.events.publish(MarketEvent::OrderbookDelta {
            side: order.side,
            price,
            quantity: self.book.level_quantity(order.side, price),
        });

        Ok(())
    }
}
