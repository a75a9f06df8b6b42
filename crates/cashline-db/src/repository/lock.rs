//! # Sync Lock Repository
//!
//! A lease lock stored in a single row, so that only one worker drains the
//! queue at a time even across processes sharing the database file.
//!
//! ## Lease Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  row: sync_lock(id = 1, locked_by, locked_at ms)                        │
//! │                                                                         │
//! │  try_acquire(owner, timeout)   ── single transaction ──                 │
//! │    ├── free                     → take it, return true                 │
//! │    ├── held, now - at > timeout → clear, take it, return true          │
//! │    └── held, not expired        → return false                         │
//! │                                                                         │
//! │  renew(owner)                                                          │
//! │    └── locked_at = now, only if locked_by = owner; false once taken    │
//! │        over (the drain stops before its next dispatch)                 │
//! │                                                                         │
//! │  release(owner)                                                        │
//! │    └── clears only if locked_by = owner                                │
//! │        (a stale holder can't free the lease a newer holder took over)   │
//! │                                                                         │
//! │  force_release()                                                       │
//! │    └── operator escape hatch, clears whoever holds it                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::DbResult;
use cashline_core::SyncLock;

/// Repository for the sync lease lock.
#[derive(Debug, Clone)]
pub struct SyncLockRepository {
    pool: SqlitePool,
}

impl SyncLockRepository {
    /// Creates a new SyncLockRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncLockRepository { pool }
    }

    /// Tries to take the lease for `owner_id`.
    ///
    /// Returns `false` without waiting when a live lease is held by anyone,
    /// including `owner_id` itself.
    pub async fn try_acquire(&self, owner_id: &str, timeout: Duration) -> DbResult<bool> {
        self.try_acquire_at(owner_id, timeout, Utc::now()).await
    }

    /// [`try_acquire`](Self::try_acquire) with an explicit clock reading.
    pub async fn try_acquire_at(
        &self,
        owner_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let now_ms = now.timestamp_millis();
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;

        // Write first: the transaction holds SQLite's write lock from here on,
        // so the read below can't go stale before the update.
        sqlx::query("INSERT OR IGNORE INTO sync_lock (id, locked_by, locked_at) VALUES (1, NULL, NULL)")
            .execute(&mut *tx)
            .await?;

        let current: SyncLock =
            sqlx::query_as("SELECT locked_by, locked_at FROM sync_lock WHERE id = 1")
                .fetch_one(&mut *tx)
                .await?;

        if let Some(holder) = current.locked_by.as_deref() {
            if !current.is_expired(now_ms, timeout_ms) {
                debug!(owner = %owner_id, holder = %holder, "Sync lock held");
                tx.rollback().await?;
                return Ok(false);
            }

            warn!(
                owner = %owner_id,
                previous_holder = %holder,
                locked_at = ?current.locked_at,
                "Sync lock expired, taking over"
            );
        }

        sqlx::query("UPDATE sync_lock SET locked_by = ?1, locked_at = ?2 WHERE id = 1")
            .bind(owner_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(owner = %owner_id, "Sync lock acquired");
        Ok(true)
    }

    /// Extends the lease held by `owner_id`.
    ///
    /// Returns `false` when another owner has taken the lease over (or it was
    /// released); the caller no longer has exclusive access to the queue.
    pub async fn renew(&self, owner_id: &str) -> DbResult<bool> {
        self.renew_at(owner_id, Utc::now()).await
    }

    /// [`renew`](Self::renew) with an explicit clock reading.
    pub async fn renew_at(&self, owner_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result =
            sqlx::query("UPDATE sync_lock SET locked_at = ?2 WHERE id = 1 AND locked_by = ?1")
                .bind(owner_id)
                .bind(now.timestamp_millis())
                .execute(&self.pool)
                .await?;

        let renewed = result.rows_affected() == 1;
        if !renewed {
            warn!(owner = %owner_id, "Sync lock lost, renewal refused");
        }
        Ok(renewed)
    }

    /// Releases the lease if `owner_id` still holds it.
    ///
    /// Returns whether anything was released.
    pub async fn release(&self, owner_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_lock SET locked_by = NULL, locked_at = NULL WHERE id = 1 AND locked_by = ?1",
        )
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() == 1;
        if released {
            debug!(owner = %owner_id, "Sync lock released");
        } else {
            warn!(owner = %owner_id, "Sync lock no longer held by this owner");
        }
        Ok(released)
    }

    /// Clears the lease regardless of who holds it.
    pub async fn force_release(&self) -> DbResult<()> {
        sqlx::query("UPDATE sync_lock SET locked_by = NULL, locked_at = NULL WHERE id = 1")
            .execute(&self.pool)
            .await?;

        warn!("Sync lock force-released");
        Ok(())
    }

    /// Returns the current lock row (free if the row is missing).
    pub async fn current(&self) -> DbResult<SyncLock> {
        let lock: Option<SyncLock> =
            sqlx::query_as("SELECT locked_by, locked_at FROM sync_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(lock.unwrap_or(SyncLock {
            locked_by: None,
            locked_at: None,
        }))
    }
}
