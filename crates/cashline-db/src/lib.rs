//! # cashline-db: Database Layer for the Cashline Sync Engine
//!
//! SQLite storage for the command queue, the lease lock, the sequencer and
//! the batch / order / refund records the engine replays to the backend.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cashline Data Flow                               │
//! │                                                                         │
//! │  Register business logic          Sync engine (cashline-sync)          │
//! │       │ outbox().record_*              │ lock / drain / mark            │
//! │       ▼                                ▼                                │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  cashline-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│ command  lock      │  │ (embedded) │  │   │
//! │  │   │ SqlitePool    │    │ sequence outbox    │  │ 001_init   │  │   │
//! │  │   │               │    │ batch order refund │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database (WAL)                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cashline_db::{Database, DbConfig};
//! use cashline_core::Batch;
//!
//! let db = Database::new(DbConfig::new("cashline.db")).await?;
//!
//! let batch = Batch::open("store-1", "cashier-7", "front", "register-2", 20_000);
//! let command = db.outbox().record_batch_opened(&batch).await?;
//! assert_eq!(command.sequence, 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::batch::BatchRepository;
pub use repository::command::SyncCommandRepository;
pub use repository::lock::SyncLockRepository;
pub use repository::order::OrderRepository;
pub use repository::outbox::OutboxRepository;
pub use repository::refund::RefundRepository;
pub use repository::sequence::SequenceRepository;
