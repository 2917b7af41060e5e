//! Submission intake: validate, claim the idempotency key, persist as open,
//! enqueue for the matcher.
//!
//! Each step strictly precedes the next. A key claimed before a failed
//! ledger insert stays claimed: the same key is rejected on retry and the
//! client must use a fresh one. That trade favors safety over client
//! convenience.

use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::idempotency::{Claim, GateError, IdempotencyGate};
use crate::ledger::{Ledger, LedgerError};
use crate::models::{NewOrder, Order, OrderPayload, OrderStatus, OrderType, Submission};
use crate::queue::{Job, JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate submission")]
    Duplicate,

    #[error("ledger rejected order: {0}")]
    Storage(#[from] LedgerError),

    #[error("failed to enqueue job: {0}")]
    Queue(#[from] QueueError),

    #[error("idempotency gate unavailable: {0}")]
    Cache(#[from] GateError),
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("order not found: {0}")]
    NotFound(Uuid),

    #[error("order is already {0}")]
    Conflict(OrderStatus),

    #[error("ledger error: {0}")]
    Storage(#[from] LedgerError),

    #[error("failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

pub struct Intake {
    ledger: Arc<dyn Ledger>,
    gate: Arc<dyn IdempotencyGate>,
    queue: Arc<dyn JobQueue>,
    instrument: String,
}

impl Intake {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gate: Arc<dyn IdempotencyGate>,
        queue: Arc<dyn JobQueue>,
        instrument: String,
    ) -> Self {
        Self {
            ledger,
            gate,
            queue,
            instrument,
        }
    }

    /// Accept a submission. On success the order is durably `open` and its
    /// job is queued; the matcher decides everything that happens next.
    pub async fn submit(&self, payload: OrderPayload) -> Result<Order, SubmitError> {
        let submission = self.validate(&payload)?;

        match self.gate.claim(&payload.idempotency_key).await? {
            Claim::New => {}
            Claim::Duplicate => return Err(SubmitError::Duplicate),
        }

        let order = self
            .ledger
            .insert_open_order(NewOrder::from_submission(
                payload.client_id,
                payload.instrument,
                submission,
            ))
            .await?;

        self.queue
            .enqueue(&Job::Submit {
                order: order.clone(),
            })
            .await?;

        tracing::info!(order_id = %order.id, side = %order.side, order_type = %order.order_type, "order accepted");
        Ok(order)
    }

    /// Request cancellation of a resting order. Best effort: the race against
    /// a fill is resolved purely by job ordering.
    pub async fn cancel(&self, order_id: Uuid) -> Result<Order, CancelError> {
        let order = self
            .ledger
            .get_order(order_id)
            .await?
            .ok_or(CancelError::NotFound(order_id))?;

        if order.status.is_terminal() {
            return Err(CancelError::Conflict(order.status));
        }

        self.queue.enqueue(&Job::Cancel { order_id }).await?;

        tracing::info!(%order_id, "cancel requested");
        Ok(order)
    }

    fn validate(&self, payload: &OrderPayload) -> Result<Submission, SubmitError> {
        if payload.client_id.trim().is_empty() {
            return Err(SubmitError::Validation("client_id must not be empty".into()));
        }
        if payload.instrument != self.instrument {
            return Err(SubmitError::Validation(format!(
                "unknown instrument: {}",
                payload.instrument
            )));
        }
        if payload.quantity <= Decimal::ZERO {
            return Err(SubmitError::Validation("quantity must be positive".into()));
        }

        match payload.order_type {
            OrderType::Limit => {
                let price = payload.price.ok_or_else(|| {
                    SubmitError::Validation("limit order requires a price".into())
                })?;
                if price <= Decimal::ZERO {
                    return Err(SubmitError::Validation("price must be positive".into()));
                }
                Ok(Submission::Limit {
                    side: payload.side,
                    price,
                    quantity: payload.quantity,
                })
            }
            OrderType::Market => {
                if payload.price.is_some() {
                    return Err(SubmitError::Validation(
                        "market order must not carry a price".into(),
                    ));
                }
                Ok(Submission::Market {
                    side: payload.side,
                    quantity: payload.quantity,
                })
            }
        }
    }
}
