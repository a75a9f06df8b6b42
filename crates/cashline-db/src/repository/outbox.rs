//! # Outbox Repository
//!
//! Register-side writes: the domain record and its sync command commit
//! together or not at all.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL OPERATION (e.g. ring up an order)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT INTO orders / order_items                           │   │
//! │  │  2. UPDATE sync_sequence  (next number)                        │   │
//! │  │  3. INSERT INTO sync_command (create_order, order_id, batch_id)│   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← record and command are never separated                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Sync engine replays commands in sequence order                        │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • The order is never lost (it's in the local DB)                      │
//! │  • No command points at a record that was never written               │
//! │  • Commands enqueued in call order replay in call order                │
//! │  • No create_order is queued behind its batch's close_batch            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use super::batch::{close_batch_on, insert_batch_on};
use super::command::enqueue_on;
use super::order::insert_order_on;
use super::refund::insert_refund_on;
use crate::error::DbResult;
use cashline_core::{Batch, NewCommand, Order, OrderItem, Refund, SyncCommand};

/// Repository for outbox writes.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    /// Creates a new OutboxRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OutboxRepository { pool }
    }

    /// Stores a newly opened batch and queues `open_batch`.
    pub async fn record_batch_opened(&self, batch: &Batch) -> DbResult<SyncCommand> {
        let mut tx = self.pool.begin().await?;
        insert_batch_on(&mut tx, batch).await?;
        let command = enqueue_on(&mut tx, &NewCommand::open_batch(&batch.id)).await?;
        tx.commit().await?;

        info!(
            batch_id = %batch.id,
            sequence = command.sequence,
            "Batch opened locally"
        );
        Ok(command)
    }

    /// Stores an order with its lines and queues `create_order`.
    pub async fn record_order(&self, order: &Order, items: &[OrderItem]) -> DbResult<SyncCommand> {
        let mut tx = self.pool.begin().await?;
        insert_order_on(&mut tx, order, items).await?;
        let command =
            enqueue_on(&mut tx, &NewCommand::create_order(&order.id, &order.batch_id)).await?;
        tx.commit().await?;

        info!(
            order_id = %order.id,
            batch_id = %order.batch_id,
            total_cents = order.total_cents,
            sequence = command.sequence,
            "Order recorded"
        );
        Ok(command)
    }

    /// Closes a batch locally with the counted cash and queues `close_batch`.
    pub async fn record_batch_closed(
        &self,
        batch_id: &str,
        closing_cash_cents: i64,
    ) -> DbResult<SyncCommand> {
        let mut tx = self.pool.begin().await?;
        close_batch_on(&mut tx, batch_id, closing_cash_cents, Utc::now()).await?;
        let command = enqueue_on(&mut tx, &NewCommand::close_batch(batch_id)).await?;
        tx.commit().await?;

        info!(
            batch_id = %batch_id,
            closing_cash_cents,
            sequence = command.sequence,
            "Batch closed locally"
        );
        Ok(command)
    }

    /// Stores a refund and queues `create_refund`.
    pub async fn record_refund(&self, refund: &Refund) -> DbResult<SyncCommand> {
        let mut tx = self.pool.begin().await?;
        insert_refund_on(&mut tx, refund).await?;
        let command =
            enqueue_on(&mut tx, &NewCommand::create_refund(&refund.id, &refund.order_id)).await?;
        tx.commit().await?;

        info!(
            refund_id = %refund.id,
            order_id = %refund.order_id,
            amount_cents = refund.amount_cents,
            sequence = command.sequence,
            "Refund recorded"
        );
        Ok(command)
    }
}
