//! # Sequence Repository
//!
//! The single counter that gives every queued command its place in line.
//!
//! ## Issuing a Number
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   ONE TRANSACTION PER NUMBER                            │
//! │                                                                         │
//! │  1. INSERT OR IGNORE INTO sync_sequence (id, current_sequence)          │
//! │     VALUES (1, 0)                    ← row exists afterwards           │
//! │                                        (and this tx now holds the      │
//! │                                         write lock)                    │
//! │  2. UPDATE sync_sequence                                               │
//! │     SET current_sequence = current_sequence + 1 WHERE id = 1           │
//! │                                                                         │
//! │  3. SELECT current_sequence FROM sync_sequence WHERE id = 1            │
//! │                                                                         │
//! │  COMMIT                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Numbers start at 1, are strictly increasing and never reused. A number
//! issued inside a transaction that later rolls back is reissued, since the
//! increment rolls back with it.

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::DbResult;

/// Repository for the sync sequence counter.
#[derive(Debug, Clone)]
pub struct SequenceRepository {
    pool: SqlitePool,
}

impl SequenceRepository {
    /// Creates a new SequenceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SequenceRepository { pool }
    }

    /// Issues the next sequence number in its own transaction.
    pub async fn next_sequence(&self) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;
        let sequence = next_sequence_on(&mut tx).await?;
        tx.commit().await?;
        Ok(sequence)
    }

    /// Returns the last issued number (0 before the first one).
    pub async fn current(&self) -> DbResult<i64> {
        let current: Option<i64> =
            sqlx::query_scalar("SELECT current_sequence FROM sync_sequence WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(current.unwrap_or(0))
    }
}

/// Issues the next sequence number on an open transaction.
///
/// The caller owns the transaction; the number is only final once it commits.
pub(crate) async fn next_sequence_on(conn: &mut SqliteConnection) -> DbResult<i64> {
    sqlx::query("INSERT OR IGNORE INTO sync_sequence (id, current_sequence) VALUES (1, 0)")
        .execute(&mut *conn)
        .await?;

    sqlx::query("UPDATE sync_sequence SET current_sequence = current_sequence + 1 WHERE id = 1")
        .execute(&mut *conn)
        .await?;

    let sequence: i64 =
        sqlx::query_scalar("SELECT current_sequence FROM sync_sequence WHERE id = 1")
            .fetch_one(&mut *conn)
            .await?;

    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        std::env::temp_dir().join(format!("cashline-{}-{}-{}.db", name, std::process::id(), nanos))
    }

    fn remove_db_files(path: &PathBuf) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one_and_increments() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let seq = db.sequence();

        assert_eq!(seq.next_sequence().await.unwrap(), 1);
        assert_eq!(seq.next_sequence().await.unwrap(), 2);
        assert_eq!(seq.next_sequence().await.unwrap(), 3);
        assert_eq!(seq.current().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_missing_row_is_recreated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        sqlx::query("DELETE FROM sync_sequence")
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.sequence().current().await.unwrap(), 0);
        assert_eq!(db.sequence().next_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rolled_back_number_is_reissued() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert_eq!(db.sequence().next_sequence().await.unwrap(), 1);

        let mut tx = db.pool().begin().await.unwrap();
        assert_eq!(next_sequence_on(&mut tx).await.unwrap(), 2);
        tx.rollback().await.unwrap();

        assert_eq!(db.sequence().next_sequence().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_distinct_numbers() {
        let path = temp_db_path("sequence");
        let db = Database::new(DbConfig::new(&path).max_connections(4))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = db.sequence();
            handles.push(tokio::spawn(async move {
                let mut issued = Vec::new();
                for _ in 0..10 {
                    issued.push(repo.next_sequence().await.unwrap());
                }
                issued
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let issued = handle.await.unwrap();
            // Each caller sees its own numbers increase
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            all.extend(issued);
        }

        let distinct: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(distinct.len(), 80);
        assert_eq!(all.iter().copied().min(), Some(1));
        assert_eq!(all.iter().copied().max(), Some(80));

        db.close().await;
        remove_db_files(&path);
    }
}
