//! # Sync Queue
//!
//! The register-facing side of sync: record local changes, look at the
//! backlog, requeue parked commands.
//!
//! Every write nudges the scheduler (when one is attached) so a connected
//! register syncs within moments instead of waiting for the next poll.

use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::scheduler::SchedulerHandle;
use cashline_core::validation::validate_new_command;
use cashline_core::{
    Batch, CommandStats, CommandStatus, NewCommand, Order, OrderItem, Refund, SyncCommand,
};
use cashline_db::{Database, DbError};

/// Enqueue API over the command store.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    db: Database,
    scheduler: Option<SchedulerHandle>,
}

impl SyncQueue {
    pub fn new(db: Database) -> Self {
        SyncQueue { db, scheduler: None }
    }

    /// Attaches a scheduler to trigger after each write.
    pub fn with_scheduler(mut self, handle: SchedulerHandle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Appends a command and returns its id.
    ///
    /// The referenced records must already be stored; prefer the `record_*`
    /// methods, which write the record and the command together.
    pub async fn enqueue(&self, command: NewCommand) -> SyncResult<String> {
        validate_new_command(&command)?;
        let queued = self.db.commands().enqueue(&command).await?;
        self.queued(&queued);
        Ok(queued.id)
    }

    pub async fn record_batch_opened(&self, batch: &Batch) -> SyncResult<SyncCommand> {
        let queued = self.db.outbox().record_batch_opened(batch).await?;
        self.queued(&queued);
        Ok(queued)
    }

    pub async fn record_order(&self, order: &Order, items: &[OrderItem]) -> SyncResult<SyncCommand> {
        let queued = self.db.outbox().record_order(order, items).await?;
        self.queued(&queued);
        Ok(queued)
    }

    pub async fn record_batch_closed(
        &self,
        batch_id: &str,
        closing_cash_cents: i64,
    ) -> SyncResult<SyncCommand> {
        let queued = self
            .db
            .outbox()
            .record_batch_closed(batch_id, closing_cash_cents)
            .await?;
        self.queued(&queued);
        Ok(queued)
    }

    pub async fn record_refund(&self, refund: &Refund) -> SyncResult<SyncCommand> {
        let queued = self.db.outbox().record_refund(refund).await?;
        self.queued(&queued);
        Ok(queued)
    }

    fn queued(&self, command: &SyncCommand) {
        debug!(
            command_id = %command.id,
            sequence = command.sequence,
            command_type = %command.command_type,
            "Command enqueued"
        );
        self.nudge();
    }

    fn nudge(&self) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.trigger() {
                debug!(error = %e, "Scheduler not accepting triggers");
            }
        }
    }

    // =========================================================================
    // Backlog
    // =========================================================================

    /// Counts per status.
    pub async fn stats(&self) -> SyncResult<CommandStats> {
        Ok(self.db.commands().stats().await?)
    }

    /// Commands still `pending`.
    pub async fn pending_count(&self) -> SyncResult<i64> {
        Ok(self.db.commands().pending_count().await?)
    }

    /// Commands in `failed`, lowest sequence first.
    pub async fn failed(&self) -> SyncResult<Vec<SyncCommand>> {
        Ok(self.db.commands().list_by_status(CommandStatus::Failed).await?)
    }

    /// Moves a failed command back to `pending` and triggers a run.
    pub async fn requeue(&self, command_id: &str) -> SyncResult<()> {
        let command = self
            .db
            .commands()
            .get_by_id(command_id)
            .await?
            .ok_or_else(|| DbError::not_found("SyncCommand", command_id))?;

        if !self.db.commands().requeue(command_id).await? {
            return Err(SyncError::NotRequeueable {
                id: command_id.to_string(),
                status: command.status.to_string(),
            });
        }

        info!(command_id = %command_id, sequence = command.sequence, "Requeued by operator");
        self.nudge();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashline_core::{CommandType, PaymentMethod, ValidationError};
    use cashline_db::DbConfig;

    async fn queue() -> (Database, SyncQueue) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        (db.clone(), SyncQueue::new(db))
    }

    #[tokio::test]
    async fn test_enqueue_validates_references() {
        let (_db, queue) = queue().await;

        let mut command = NewCommand::create_order("o-1", "b-1");
        command.batch_id = None;
        let err = queue.enqueue(command).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::MissingReference { .. })
        ));

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_returns_command_id() {
        let (db, queue) = queue().await;
        let id = queue.enqueue(NewCommand::open_batch("b-1")).await.unwrap();

        let stored = db.commands().get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.command_type, CommandType::OpenBatch);
        assert_eq!(stored.sequence, 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_requeue_only_failed() {
        let (db, queue) = queue().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        let cmd = queue.record_batch_opened(&batch).await.unwrap();

        let err = queue.requeue(&cmd.id).await.unwrap_err();
        assert!(matches!(err, SyncError::NotRequeueable { .. }));
        assert!(err.to_string().contains("is pending"));

        db.commands().mark_running(&cmd.id).await.unwrap();
        db.commands().mark_failed(&cmd.id, "boom").await.unwrap();
        assert_eq!(queue.failed().await.unwrap().len(), 1);

        queue.requeue(&cmd.id).await.unwrap();
        let stored = db.commands().get_by_id(&cmd.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Pending);
        assert_eq!(stored.last_error, None);
        assert_eq!(stored.attempts, 1);

        let err = queue.requeue("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::DatabaseError(DbError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_record_order_queues_after_open() {
        let (_db, queue) = queue().await;
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 5_000);
        queue.record_batch_opened(&batch).await.unwrap();

        let mut order = Order::new(&batch.id, "R-0001", PaymentMethod::Cash);
        let items = vec![OrderItem::new(&order.id, "p-1", "BREAD", "Bread", 450, 1, 0)];
        order.apply_items(&items);
        let cmd = queue.record_order(&order, &items).await.unwrap();

        assert_eq!(cmd.sequence, 2);
        assert_eq!(queue.pending_count().await.unwrap(), 2);
    }
}
