//! # Batch Repository
//!
//! Cash batch records and their sync status.
//!
//! ## Status Writes
//! ```text
//! local_only ──mark_synced_open──► synced_open ──mark_synced_closed──► synced_closed
//!
//! close_locally: sets closing cash + closed_at, status untouched
//! ```
//! Status writes never move backwards; `mark_synced_open` on a closed batch
//! fails with [`DbError::InvalidTransition`].

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use cashline_core::validation::{ensure_forward, validate_cash_amount};
use cashline_core::{Batch, BatchSyncStatus};

const BATCH_COLUMNS: &str = "id, store_id, user_id, location_id, register_id, \
     starting_cash_cents, closing_cash_cents, opened_at, closed_at, \
     sync_status, remote_id, last_error, created_at, updated_at";

/// Repository for cash batches.
#[derive(Debug, Clone)]
pub struct BatchRepository {
    pool: SqlitePool,
}

impl BatchRepository {
    /// Creates a new BatchRepository.
    pub fn new(pool: SqlitePool) -> Self {
        BatchRepository { pool }
    }

    /// Inserts a batch without queueing a command.
    ///
    /// Register code should use
    /// [`OutboxRepository::record_batch_opened`](super::outbox::OutboxRepository::record_batch_opened).
    pub async fn insert(&self, batch: &Batch) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_batch_on(&mut conn, batch).await
    }

    /// Gets a batch by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1");
        let batch = sqlx::query_as::<_, Batch>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(batch)
    }

    /// Records that the backend opened the batch.
    ///
    /// Allowed from `local_only` and `synced_open` (replay).
    pub async fn mark_synced_open(&self, id: &str, remote_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET
                sync_status = 'synced_open',
                remote_id = ?2,
                last_error = NULL,
                updated_at = ?3
            WHERE id = ?1 AND sync_status IN ('local_only', 'synced_open')
            "#,
        )
        .bind(id)
        .bind(remote_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.refused(id, BatchSyncStatus::SyncedOpen).await);
        }

        debug!(batch_id = %id, remote_id = %remote_id, "Batch synced open");
        Ok(())
    }

    /// Records that the backend closed the batch.
    pub async fn mark_synced_closed(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET
                sync_status = 'synced_closed',
                last_error = NULL,
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Batch", id));
        }

        debug!(batch_id = %id, "Batch synced closed");
        Ok(())
    }

    /// Stores (or clears, with `None`) the last sync failure for a batch.
    pub async fn set_last_error(&self, id: &str, error: Option<&str>) -> DbResult<()> {
        sqlx::query("UPDATE batches SET last_error = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(error)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn refused(&self, id: &str, to: BatchSyncStatus) -> DbError {
        match self.get_by_id(id).await {
            Ok(Some(batch)) => match ensure_forward("Batch", id, batch.sync_status, to) {
                Err(e) => e.into(),
                Ok(()) => DbError::Conflict(format!("batch {} changed during update", id)),
            },
            Ok(None) => DbError::not_found("Batch", id),
            Err(e) => e,
        }
    }
}

pub(crate) async fn insert_batch_on(conn: &mut SqliteConnection, batch: &Batch) -> DbResult<()> {
    validate_cash_amount("starting_cash_cents", batch.starting_cash_cents)?;

    sqlx::query(
        r#"
        INSERT INTO batches (
            id, store_id, user_id, location_id, register_id,
            starting_cash_cents, closing_cash_cents, opened_at, closed_at,
            sync_status, remote_id, last_error, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(&batch.id)
    .bind(&batch.store_id)
    .bind(&batch.user_id)
    .bind(&batch.location_id)
    .bind(&batch.register_id)
    .bind(batch.starting_cash_cents)
    .bind(batch.closing_cash_cents)
    .bind(batch.opened_at)
    .bind(batch.closed_at)
    .bind(batch.sync_status)
    .bind(&batch.remote_id)
    .bind(&batch.last_error)
    .bind(batch.created_at)
    .bind(batch.updated_at)
    .execute(&mut *conn)
    .await?;

    debug!(batch_id = %batch.id, register_id = %batch.register_id, "Batch inserted");
    Ok(())
}

/// Closes a batch on this device: stores the counted cash and close time.
///
/// Refused if the batch is missing or already closed.
pub(crate) async fn close_batch_on(
    conn: &mut SqliteConnection,
    batch_id: &str,
    closing_cash_cents: i64,
    closed_at: DateTime<Utc>,
) -> DbResult<()> {
    validate_cash_amount("closing_cash_cents", closing_cash_cents)?;

    let result = sqlx::query(
        r#"
        UPDATE batches SET
            closing_cash_cents = ?2,
            closed_at = ?3,
            updated_at = ?3
        WHERE id = ?1 AND closing_cash_cents IS NULL
        "#,
    )
    .bind(batch_id)
    .bind(closing_cash_cents)
    .bind(closed_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM batches WHERE id = ?1")
            .bind(batch_id)
            .fetch_optional(&mut *conn)
            .await?;

        return Err(match exists {
            Some(_) => DbError::Conflict(format!("batch {} is already closed", batch_id)),
            None => DbError::not_found("Batch", batch_id),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn setup() -> (Database, Batch) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let batch = Batch::open("store-1", "cashier-7", "front", "register-2", 20_000);
        db.batches().insert(&batch).await.unwrap();
        (db, batch)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (db, batch) = setup().await;

        let loaded = db.batches().get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.register_id, "register-2");
        assert_eq!(loaded.starting_cash_cents, 20_000);
        assert_eq!(loaded.sync_status, BatchSyncStatus::LocalOnly);
        assert!(loaded.closing_cash_cents.is_none());
        assert!(db.batches().get_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_starting_cash_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let batch = Batch::open("s", "u", "l", "r", -5);

        let err = db.batches().insert(&batch).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[tokio::test]
    async fn test_status_moves_forward() {
        let (db, batch) = setup().await;
        let repo = db.batches();

        repo.mark_synced_open(&batch.id, "srv-1").await.unwrap();
        // Replay of the same step is fine
        repo.mark_synced_open(&batch.id, "srv-1").await.unwrap();
        repo.mark_synced_closed(&batch.id).await.unwrap();

        let loaded = repo.get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, BatchSyncStatus::SyncedClosed);
        assert_eq!(loaded.remote_id.as_deref(), Some("srv-1"));

        let err = repo.mark_synced_open(&batch.id, "srv-1").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_mark_missing_batch() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert!(db
            .batches()
            .mark_synced_open("missing", "srv")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(db
            .batches()
            .mark_synced_closed("missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_close_locally_once() {
        let (db, batch) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        close_batch_on(&mut conn, &batch.id, 35_500, Utc::now())
            .await
            .unwrap();
        let err = close_batch_on(&mut conn, &batch.id, 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
        drop(conn);

        let loaded = db.batches().get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.closing_cash_cents, Some(35_500));
        assert!(loaded.closed_at.is_some());
        assert!(loaded.is_closed_locally());
    }

    #[tokio::test]
    async fn test_last_error_cleared_on_sync() {
        let (db, batch) = setup().await;
        let repo = db.batches();

        repo.set_last_error(&batch.id, Some("503 from backend"))
            .await
            .unwrap();
        let loaded = repo.get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_error.as_deref(), Some("503 from backend"));

        repo.mark_synced_open(&batch.id, "srv-1").await.unwrap();
        let loaded = repo.get_by_id(&batch.id).await.unwrap().unwrap();
        assert!(loaded.last_error.is_none());
    }
}
