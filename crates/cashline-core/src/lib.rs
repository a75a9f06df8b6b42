//! # cashline-core: Pure Types for the Cashline Sync Engine
//!
//! Domain records, the sync command model and the rules that guard them.
//! Nothing in here touches a database, a socket or a file.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cashline Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Business logic (register UI, out of scope)           │   │
//! │  │      open batch ──► ring orders ──► refund ──► close batch      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ enqueue                                │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ cashline-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐  ┌───────────────┐  ┌───────────────────┐  │   │
//! │  │   │    types      │  │  validation   │  │      error        │  │   │
//! │  │   │ Batch, Order  │  │ command refs  │  │ CoreError         │  │   │
//! │  │   │ SyncCommand   │  │ forward-only  │  │ ValidationError   │  │   │
//! │  │   └───────────────┘  └───────────────┘  └───────────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │         cashline-db (SQLite)  ──►  cashline-sync (engine)        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, status enums, `SyncCommand`, `SyncLock`
//! - [`validation`] - Command reference and status transition rules
//! - [`error`] - Domain error types
//!
//! ## Example
//!
//! ```rust
//! use cashline_core::{Batch, BatchSyncStatus, MonotonicStatus, NewCommand};
//! use cashline_core::validation::validate_new_command;
//!
//! let batch = Batch::open("store-1", "cashier-7", "front", "register-2", 20_000);
//! assert_eq!(batch.sync_status, BatchSyncStatus::LocalOnly);
//!
//! let command = NewCommand::open_batch(&batch.id);
//! assert!(validate_new_command(&command).is_ok());
//!
//! assert!(!BatchSyncStatus::SyncedClosed.can_advance_to(BatchSyncStatus::LocalOnly));
//! ```

pub mod error;
pub mod types;
pub mod validation;

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

/// Default lease duration for the sync lock, in seconds.
///
/// Long enough for a full drain over a slow link; short enough that a
/// crashed worker does not stall syncing for long.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

/// Default number of dispatches a failed command gets before it is parked.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
