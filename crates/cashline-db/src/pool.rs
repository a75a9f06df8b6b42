//! # Database Handle
//!
//! Opens the register's SQLite file and hands out repositories.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DbConfig ──► Database::new ──► SqlitePool (WAL, foreign keys on)      │
//! │                    │                                                    │
//! │                    └─ embedded migrations                              │
//! │                                                                         │
//! │  Database (Clone, shares the pool)                                     │
//! │    ├── outbox()      register writes: record + command, one tx         │
//! │    ├── commands()    the replay queue                                  │
//! │    ├── sync_lock()   lease lock                                        │
//! │    ├── sequence()    sequence counter                                  │
//! │    └── batches() / orders() / refunds()                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! WAL lets the register read while the worker writes. Writers are still
//! serialized by SQLite; the lock and sequencer transactions open with a
//! write so their read-modify-write cannot interleave with another caller.
//! `busy_timeout` makes a second writer wait instead of failing at once.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::migrations::{self, MigrationStatus};
use crate::repository::batch::BatchRepository;
use crate::repository::command::SyncCommandRepository;
use crate::repository::lock::SyncLockRepository;
use crate::repository::order::OrderRepository;
use crate::repository::outbox::OutboxRepository;
use crate::repository::refund::RefundRepository;
use crate::repository::sequence::SequenceRepository;

const IN_MEMORY: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where and how to open the database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file (created if missing), or `:memory:`.
    pub path: PathBuf,

    /// Pool size. Default: 4
    pub max_connections: u32,

    /// How long to wait for a free pooled connection. Default: 30s
    pub acquire_timeout: Duration,

    /// How long a statement waits on another writer. Default: 5s
    pub busy_timeout: Duration,

    /// Apply embedded migrations on open. Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: path.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    /// Private in-memory database for tests.
    ///
    /// One connection only: every in-memory connection is a separate database.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            ..DbConfig::new(IN_MEMORY)
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.path.as_os_str() == IN_MEMORY {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        Ok(options
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Shared handle to the register database.
///
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("cashline.db")).await?;
/// db.outbox().record_order(&order, &items).await?;
///
/// if db.sync_lock().try_acquire("register-1", timeout).await? {
///     let head = db.commands().next_dispatchable().await?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and, unless disabled, migrates the schema.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "Database opened"
        );

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub async fn migration_status(&self) -> DbResult<MigrationStatus> {
        migrations::migration_status(&self.pool).await
    }

    /// Raw pool, for callers that need their own transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// Register-side writes: domain record and sync command in one transaction.
    pub fn outbox(&self) -> OutboxRepository {
        OutboxRepository::new(self.pool.clone())
    }

    pub fn commands(&self) -> SyncCommandRepository {
        SyncCommandRepository::new(self.pool.clone())
    }

    pub fn sync_lock(&self) -> SyncLockRepository {
        SyncLockRepository::new(self.pool.clone())
    }

    pub fn sequence(&self) -> SequenceRepository {
        SequenceRepository::new(self.pool.clone())
    }

    pub fn batches(&self) -> BatchRepository {
        BatchRepository::new(self.pool.clone())
    }

    pub fn orders(&self) -> OrderRepository {
        OrderRepository::new(self.pool.clone())
    }

    pub fn refunds(&self) -> RefundRepository {
        RefundRepository::new(self.pool.clone())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Closes the pool; later repository calls fail.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database closed");
    }

    /// Returns true if a trivial query succeeds.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert!(db.health_check().await);
        let status = db.migration_status().await.unwrap();
        assert!(status.is_current());
        assert_eq!(status.embedded, 1);
    }

    #[tokio::test]
    async fn test_singletons_seeded_by_migration() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert_eq!(db.sequence().current().await.unwrap(), 0);
        assert!(db.sync_lock().current().await.unwrap().is_free());
    }

    #[tokio::test]
    async fn test_file_database_pragmas() {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let path = std::env::temp_dir().join(format!("cashline-pool-{}-{}.db", std::process::id(), nanos));
        let db = Database::new(DbConfig::new(&path)).await.unwrap();

        let journal: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(journal, "wal");

        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);

        db.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    #[tokio::test]
    async fn test_closed_database_is_unhealthy() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(!db.health_check().await);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/register.db")
            .max_connections(8)
            .busy_timeout(Duration::from_secs(1))
            .run_migrations(false);

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
        assert!(!config.run_migrations);

        let mem = DbConfig::in_memory();
        assert_eq!(mem.max_connections, 1);
        assert!(mem.run_migrations);
    }

}
