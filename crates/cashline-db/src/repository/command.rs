//! # Sync Command Repository
//!
//! The persistent FIFO queue the engine drains.
//!
//! ## Command Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue ──► pending ──mark_running──► running ──mark_done──► done     │
//! │                 ▲                         │                             │
//! │                 │                         └──mark_failed──► failed     │
//! │                 │                                             │         │
//! │                 ├──────── reset_running (crash recovery) ◄────┤running │
//! │                 └──────── requeue (operator) ◄────────────────┘         │
//! │                                                                         │
//! │  attempts += 1 on done, failed and crash recovery                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Head of the Queue
//! [`next_dispatchable`](SyncCommandRepository::next_dispatchable) returns the
//! lowest sequence among `pending` and `failed` commands. A failed command
//! therefore stays at the head and keeps every later command waiting.

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::sequence::next_sequence_on;
use crate::error::{DbError, DbResult};
use cashline_core::validation::validate_new_command;
use cashline_core::{new_record_id, CommandStats, CommandStatus, NewCommand, SyncCommand};

const COMMAND_COLUMNS: &str = "id, sequence, command_type, status, batch_id, order_id, refund_id, \
     attempts, last_error, created_at, updated_at";

/// Repository for the sync command queue.
#[derive(Debug, Clone)]
pub struct SyncCommandRepository {
    pool: SqlitePool,
}

impl SyncCommandRepository {
    /// Creates a new SyncCommandRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncCommandRepository { pool }
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Validates and queues a command as `pending` with the next sequence.
    ///
    /// The sequence number and the row are written in one transaction.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let cmd = repo.enqueue(&NewCommand::open_batch(&batch.id)).await?;
    /// assert_eq!(cmd.status, CommandStatus::Pending);
    /// ```
    pub async fn enqueue(&self, command: &NewCommand) -> DbResult<SyncCommand> {
        let mut tx = self.pool.begin().await?;
        let queued = enqueue_on(&mut tx, command).await?;
        tx.commit().await?;
        Ok(queued)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets a command by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<SyncCommand>> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM sync_command WHERE id = ?1");
        let command = sqlx::query_as::<_, SyncCommand>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(command)
    }

    /// Returns the unfinished command with the lowest sequence, if any.
    pub async fn next_dispatchable(&self) -> DbResult<Option<SyncCommand>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM sync_command \
             WHERE status IN ('pending', 'failed') \
             ORDER BY sequence ASC LIMIT 1"
        );
        let command = sqlx::query_as::<_, SyncCommand>(&sql)
            .fetch_optional(&self.pool)
            .await?;

        Ok(command)
    }

    /// Lists commands in sequence order.
    pub async fn list(&self, limit: u32) -> DbResult<Vec<SyncCommand>> {
        let sql =
            format!("SELECT {COMMAND_COLUMNS} FROM sync_command ORDER BY sequence ASC LIMIT ?1");
        let commands = sqlx::query_as::<_, SyncCommand>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(commands)
    }

    /// Lists commands with the given status in sequence order.
    pub async fn list_by_status(&self, status: CommandStatus) -> DbResult<Vec<SyncCommand>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM sync_command WHERE status = ?1 ORDER BY sequence ASC"
        );
        let commands = sqlx::query_as::<_, SyncCommand>(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        Ok(commands)
    }

    /// Counts commands per status.
    pub async fn stats(&self) -> DbResult<CommandStats> {
        let rows: Vec<(CommandStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_command GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = CommandStats::default();
        for (status, count) in rows {
            match status {
                CommandStatus::Pending => stats.pending = count,
                CommandStatus::Running => stats.running = count,
                CommandStatus::Done => stats.done = count,
                CommandStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Counts commands waiting in `pending`.
    pub async fn pending_count(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_command WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // =========================================================================
    // Status Transitions
    // =========================================================================

    /// Moves a pending or failed command to `running`.
    ///
    /// Refused with [`DbError::Conflict`] if another command is already
    /// running, keeping at most one `running` row.
    pub async fn mark_running(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_command SET
                status = 'running',
                updated_at = ?2
            WHERE id = ?1
              AND status IN ('pending', 'failed')
              AND NOT EXISTS (SELECT 1 FROM sync_command WHERE status = 'running')
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, "running").await);
        }

        debug!(command_id = %id, "Command running");
        Ok(())
    }

    /// Completes a running command.
    pub async fn mark_done(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_command SET
                status = 'done',
                attempts = attempts + 1,
                last_error = NULL,
                updated_at = ?2
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, "done").await);
        }
        Ok(())
    }

    /// Records a failed dispatch of a running command.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_command SET
                status = 'failed',
                attempts = attempts + 1,
                last_error = ?2,
                updated_at = ?3
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, "failed").await);
        }
        Ok(())
    }

    /// Crash recovery: puts every `running` command back to `pending`.
    ///
    /// Returns how many were reset.
    pub async fn reset_running(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_command SET
                status = 'pending',
                attempts = attempts + 1,
                updated_at = ?1
            WHERE status = 'running'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(count = reset, "Recovered interrupted commands");
        }
        Ok(reset)
    }

    /// Operator action: moves a failed command back to `pending`.
    ///
    /// Clears `last_error` and keeps `attempts`. Returns false if the command
    /// is not in `failed`.
    pub async fn requeue(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_command SET
                status = 'pending',
                last_error = NULL,
                updated_at = ?2
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected() == 1;
        if requeued {
            info!(command_id = %id, "Command requeued");
        }
        Ok(requeued)
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Deletes `done` commands created before `cutoff`.
    pub async fn cleanup_done_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_command WHERE status = 'done' AND created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes `done` commands older than `days_old` days.
    pub async fn cleanup_old_entries(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_old));
        let deleted = self.cleanup_done_before(cutoff).await?;

        if deleted > 0 {
            info!(deleted, days_old, "Cleaned up finished commands");
        }
        Ok(deleted)
    }

    async fn transition_conflict(&self, id: &str, target: &str) -> DbError {
        match self.get_by_id(id).await {
            Ok(Some(current)) => DbError::Conflict(format!(
                "command {} cannot move from {} to {}",
                id, current.status, target
            )),
            Ok(None) => DbError::not_found("SyncCommand", id),
            Err(e) => e,
        }
    }
}

/// Validates and inserts a command on an open transaction.
pub(crate) async fn enqueue_on(
    conn: &mut SqliteConnection,
    command: &NewCommand,
) -> DbResult<SyncCommand> {
    validate_new_command(command)?;

    let sequence = next_sequence_on(&mut *conn).await?;
    let now = Utc::now();

    let queued = SyncCommand {
        id: new_record_id(),
        sequence,
        command_type: command.command_type,
        status: CommandStatus::Pending,
        batch_id: command.batch_id.clone(),
        order_id: command.order_id.clone(),
        refund_id: command.refund_id.clone(),
        attempts: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO sync_command (
            id, sequence, command_type, status, batch_id, order_id, refund_id,
            attempts, last_error, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&queued.id)
    .bind(queued.sequence)
    .bind(queued.command_type)
    .bind(queued.status)
    .bind(&queued.batch_id)
    .bind(&queued.order_id)
    .bind(&queued.refund_id)
    .bind(queued.attempts)
    .bind(&queued.last_error)
    .bind(queued.created_at)
    .bind(queued.updated_at)
    .execute(&mut *conn)
    .await?;

    debug!(
        command_id = %queued.id,
        sequence = queued.sequence,
        command_type = %queued.command_type,
        "Command enqueued"
    );

    Ok(queued)
}
