//! # Command Handlers
//!
//! One handler per [`CommandType`]. Each checks its preconditions against the
//! local store, calls the backend, then records the result locally.
//!
//! ```text
//! ┌────────────────┬───────────────────────────────┬─────────────────────────┐
//! │ Command        │ Precondition                  │ On success              │
//! ├────────────────┼───────────────────────────────┼─────────────────────────┤
//! │ open_batch     │ batch exists                  │ batch → synced_open     │
//! │ create_order   │ batch synced_open, order      │ order → synced          │
//! │                │ exists                        │                         │
//! │ close_batch    │ batch exists and was closed   │ batch → synced_closed   │
//! │                │ locally (closing cash)        │                         │
//! │ create_refund  │ refund exists, parent order   │ refund → synced         │
//! │                │ has a remote id               │                         │
//! └────────────────┴───────────────────────────────┴─────────────────────────┘
//! ```
//!
//! A record that already reached its target status is skipped without a
//! remote call, so replaying a command after a crash is harmless.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::remote::{
    CloseBatchRequest, CreateOrderRequest, CreateRefundRequest, OpenBatchRequest, RemoteApi,
    RemoteError,
};
use cashline_core::{
    Batch, BatchSyncStatus, CommandType, MonotonicStatus, OrderSyncStatus, RefundSyncStatus,
    SyncCommand,
};
use cashline_db::{Database, DbError};

/// Why a command could not be applied.
///
/// The `Display` text is stored as the command's `last_error`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Local state does not allow the command yet (or ever).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The backend call failed.
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),

    /// Reading or writing the domain record failed.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl HandlerError {
    fn precondition(message: impl Into<String>) -> Self {
        HandlerError::Precondition(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Dispatches commands to their handler.
#[derive(Clone)]
pub struct CommandHandlers {
    db: Database,
    remote: Arc<dyn RemoteApi>,
}

impl CommandHandlers {
    pub fn new(db: Database, remote: Arc<dyn RemoteApi>) -> Self {
        CommandHandlers { db, remote }
    }

    /// Runs the handler for `command.command_type`.
    pub async fn dispatch(&self, command: &SyncCommand) -> HandlerResult {
        match command.command_type {
            CommandType::OpenBatch => self.open_batch(command).await,
            CommandType::CreateOrder => self.create_order(command).await,
            CommandType::CloseBatch => self.close_batch(command).await,
            CommandType::CreateRefund => self.create_refund(command).await,
        }
    }

    // =========================================================================
    // Batches
    // =========================================================================

    async fn open_batch(&self, command: &SyncCommand) -> HandlerResult {
        let batch = self.load_batch(command).await?;

        if batch.sync_status.has_reached(BatchSyncStatus::SyncedOpen) {
            debug!(batch_id = %batch.id, "Batch already open on backend, skipping");
            return Ok(());
        }

        let request = OpenBatchRequest::from(&batch);
        let record = match self.remote.open_batch(&request).await {
            Ok(record) => record,
            Err(e) => return Err(self.batch_failed(&batch.id, e).await),
        };

        self.db.batches().mark_synced_open(&batch.id, &record.id).await?;
        info!(batch_id = %batch.id, remote_id = %record.id, "Batch opened on backend");
        Ok(())
    }

    async fn close_batch(&self, command: &SyncCommand) -> HandlerResult {
        let batch = self.load_batch(command).await?;

        if batch.sync_status.has_reached(BatchSyncStatus::SyncedClosed) {
            debug!(batch_id = %batch.id, "Batch already closed on backend, skipping");
            return Ok(());
        }

        let (closing_cash_cents, closed_at) = match (batch.closing_cash_cents, batch.closed_at) {
            (Some(cash), Some(at)) => (cash, at),
            _ => {
                return Err(HandlerError::precondition(format!(
                    "batch {} has not been closed locally",
                    batch.id
                )))
            }
        };

        // Informational only: FIFO order means earlier orders were replayed.
        match self.db.orders().count_unsynced_in_batch(&batch.id).await {
            Ok(0) => {}
            Ok(unsynced) => warn!(
                batch_id = %batch.id,
                unsynced,
                "Closing batch with orders not yet on backend"
            ),
            Err(e) => debug!(batch_id = %batch.id, error = %e, "Could not count unsynced orders"),
        }

        let request = CloseBatchRequest {
            local_id: batch.id.clone(),
            closing_cash_cents,
            closed_at,
        };
        if let Err(e) = self.remote.close_batch(batch.remote_key(), &request).await {
            return Err(self.batch_failed(&batch.id, e).await);
        }

        self.db.batches().mark_synced_closed(&batch.id).await?;
        info!(batch_id = %batch.id, closing_cash_cents, "Batch closed on backend");
        Ok(())
    }

    async fn load_batch(&self, command: &SyncCommand) -> Result<Batch, HandlerError> {
        let batch_id = command.batch_id.as_deref().ok_or_else(|| {
            HandlerError::precondition(format!("{} command has no batch_id", command.command_type))
        })?;

        self.db
            .batches()
            .get_by_id(batch_id)
            .await?
            .ok_or_else(|| HandlerError::precondition(format!("batch {} not found", batch_id)))
    }

    /// Mirrors a remote failure onto the batch row.
    async fn batch_failed(&self, batch_id: &str, err: RemoteError) -> HandlerError {
        let message = err.to_string();
        if let Err(e) = self
            .db
            .batches()
            .set_last_error(batch_id, Some(&message))
            .await
        {
            debug!(batch_id = %batch_id, error = %e, "Could not record batch error");
        }
        HandlerError::Remote(err)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    async fn create_order(&self, command: &SyncCommand) -> HandlerResult {
        let order_id = command.order_id.as_deref().ok_or_else(|| {
            HandlerError::precondition("create_order command has no order_id")
        })?;
        let batch = self.load_batch(command).await?;

        if batch.sync_status != BatchSyncStatus::SyncedOpen {
            return Err(HandlerError::precondition(format!(
                "batch {} is {}, expected synced_open",
                batch.id,
                batch.sync_status.as_str()
            )));
        }

        let order = self
            .db
            .orders()
            .get_by_id(order_id)
            .await?
            .ok_or_else(|| HandlerError::precondition(format!("order {} not found", order_id)))?;

        if order.sync_status.has_reached(OrderSyncStatus::Synced) {
            debug!(order_id = %order.id, "Order already on backend, skipping");
            return Ok(());
        }

        let items = self.db.orders().get_items(&order.id).await?;
        let request = CreateOrderRequest::new(&order, &items, batch.remote_key());
        let record = self.remote.create_order(&request).await?;

        self.db.orders().mark_synced(&order.id, &record.id).await?;
        info!(
            order_id = %order.id,
            remote_id = %record.id,
            lines = items.len(),
            "Order created on backend"
        );
        Ok(())
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    async fn create_refund(&self, command: &SyncCommand) -> HandlerResult {
        let refund_id = command.refund_id.as_deref().ok_or_else(|| {
            HandlerError::precondition("create_refund command has no refund_id")
        })?;

        let refund = self
            .db
            .refunds()
            .get_by_id(refund_id)
            .await?
            .ok_or_else(|| HandlerError::precondition(format!("refund {} not found", refund_id)))?;

        if refund.sync_status.has_reached(RefundSyncStatus::Synced) {
            debug!(refund_id = %refund.id, "Refund already on backend, skipping");
            return Ok(());
        }

        let order = self
            .db
            .orders()
            .get_by_id(&refund.order_id)
            .await?
            .ok_or_else(|| {
                HandlerError::precondition(format!("order {} not found", refund.order_id))
            })?;
        let order_remote_id = order.remote_id.as_deref().ok_or_else(|| {
            HandlerError::precondition(format!("order {} has no remote id yet", order.id))
        })?;

        let request = CreateRefundRequest::new(&refund, order_remote_id);
        let record = self.remote.create_refund(&request).await?;

        self.db.refunds().mark_synced(&refund.id, &record.id).await?;
        info!(
            refund_id = %refund.id,
            remote_id = %record.id,
            amount_cents = refund.amount_cents,
            "Refund created on backend"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingRemote, RemoteCall};
    use cashline_core::{NewCommand, Order, OrderItem, PaymentMethod, Refund};
    use cashline_db::DbConfig;

    async fn setup() -> (Database, Arc<RecordingRemote>, CommandHandlers) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(RecordingRemote::new());
        let handlers = CommandHandlers::new(db.clone(), remote.clone());
        (db, remote, handlers)
    }

    fn sample_order(batch_id: &str) -> (Order, Vec<OrderItem>) {
        let mut order = Order::new(batch_id, "R-0001", PaymentMethod::Cash);
        let items = vec![OrderItem::new(&order.id, "p-1", "TEA", "Green tea", 300, 2, 0)];
        order.apply_items(&items);
        (order, items)
    }

    #[tokio::test]
    async fn test_open_batch_marks_synced_open() {
        let (db, remote, handlers) = setup().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 10_000);
        let cmd = db.outbox().record_batch_opened(&batch).await.unwrap();

        handlers.dispatch(&cmd).await.unwrap();

        let stored = db.batches().get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, BatchSyncStatus::SyncedOpen);
        assert!(stored.remote_id.is_some());
        assert_eq!(remote.calls(), vec![RemoteCall::OpenBatch(batch.id.clone())]);

        // Replay is a local no-op
        handlers.dispatch(&cmd).await.unwrap();
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_create_order_requires_synced_open_batch() {
        let (db, remote, handlers) = setup().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.outbox().record_batch_opened(&batch).await.unwrap();
        let (order, items) = sample_order(&batch.id);
        let cmd = db.outbox().record_order(&order, &items).await.unwrap();

        let err = handlers.dispatch(&cmd).await.unwrap_err();
        assert!(matches!(err, HandlerError::Precondition(_)));
        assert!(err.to_string().contains("expected synced_open"));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_order_sends_lines_with_batch_remote_id() {
        let (db, remote, handlers) = setup().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.outbox().record_batch_opened(&batch).await.unwrap();
        db.batches().mark_synced_open(&batch.id, "srv-b-1").await.unwrap();
        let (order, items) = sample_order(&batch.id);
        let cmd = db.outbox().record_order(&order, &items).await.unwrap();

        handlers.dispatch(&cmd).await.unwrap();

        let sent = remote.last_order().unwrap();
        assert_eq!(sent.batch_id, "srv-b-1");
        assert_eq!(sent.items.len(), 1);
        assert_eq!(sent.total_cents, 600);

        let stored = db.orders().get_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, OrderSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_close_batch_requires_local_close() {
        let (db, _remote, handlers) = setup().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.outbox().record_batch_opened(&batch).await.unwrap();

        // A close command enqueued directly, without closing cash
        let cmd = db
            .commands()
            .enqueue(&NewCommand::close_batch(&batch.id))
            .await
            .unwrap();

        let err = handlers.dispatch(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("not been closed locally"));
    }

    #[tokio::test]
    async fn test_remote_failure_recorded_on_batch() {
        let (db, remote, handlers) = setup().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        let cmd = db.outbox().record_batch_opened(&batch).await.unwrap();
        remote.fail_next(RemoteError::Transport("connection reset".into()));

        let err = handlers.dispatch(&cmd).await.unwrap_err();
        assert!(matches!(err, HandlerError::Remote(_)));

        let stored = db.batches().get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, BatchSyncStatus::LocalOnly);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("transport error: connection reset")
        );
    }

    #[tokio::test]
    async fn test_refund_requires_parent_remote_id() {
        let (db, remote, handlers) = setup().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.outbox().record_batch_opened(&batch).await.unwrap();
        let (order, items) = sample_order(&batch.id);
        db.outbox().record_order(&order, &items).await.unwrap();
        let refund = Refund::new(&order.id, 300, Some("damaged".into()));
        let cmd = db.outbox().record_refund(&refund).await.unwrap();

        let err = handlers.dispatch(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("has no remote id"));

        db.orders().mark_synced(&order.id, "srv-o-1").await.unwrap();
        handlers.dispatch(&cmd).await.unwrap();

        assert_eq!(
            remote.calls(),
            vec![RemoteCall::CreateRefund(refund.id.clone())]
        );
        let stored = db.refunds().get_by_id(&refund.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, RefundSyncStatus::Synced);
    }
}
