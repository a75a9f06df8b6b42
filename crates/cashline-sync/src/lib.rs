//! # cashline-sync: Sync Engine for Cashline POS
//!
//! Replays the register's queued commands to the backend, strictly in the
//! order they were recorded, with at most one worker draining at a time.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  Register UI                                                           │
//! │      │  record_batch_opened / record_order / record_refund / close     │
//! │      ▼                                                                  │
//! │  ┌────────────────┐   outbox write (record + command, one tx)          │
//! │  │   SyncQueue    │──────────────────────────────► sync_command        │
//! │  └───────┬────────┘                                    ▲               │
//! │          │ trigger                                      │               │
//! │          ▼                                              │               │
//! │  ┌────────────────┐   interval / trigger / backoff     │               │
//! │  │ SyncScheduler  │                                     │               │
//! │  └───────┬────────┘                                     │               │
//! │          │ run()                                        │               │
//! │          ▼                                              │               │
//! │  ┌────────────────┐   lease lock, recovery, FIFO drain  │               │
//! │  │   SyncEngine   │─────────────────────────────────────┘               │
//! │  └───────┬────────┘                                                     │
//! │          │ dispatch (exhaustive match on CommandType)                   │
//! │          ▼                                                              │
//! │  ┌────────────────┐        ┌──────────────────────────┐                │
//! │  │CommandHandlers │───────►│ RemoteApi (HttpRemoteApi)│──► backend     │
//! │  └────────────────┘        └──────────────────────────┘                │
//! │                                                                         │
//! │  GUARANTEES:                                                           │
//! │  • Commands reach the backend in sequence order                        │
//! │  • A failed command halts the run; nothing behind it is attempted     │
//! │  • Overlapping runs are serialized by the lease lock                   │
//! │  • A run killed mid-command is recovered by the next run               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Sync configuration (device, remote, engine, schedule)
//! - [`engine`] - One invocation: lock, recover, drain
//! - [`error`] - Sync error types
//! - [`handlers`] - Per-command handlers
//! - [`queue`] - Enqueue API
//! - [`remote`] - Backend client trait and HTTP implementation
//! - [`scheduler`] - Periodic and triggered runs with backoff
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cashline_sync::{EngineOptions, HttpRemoteApi, SyncConfig, SyncEngine, SyncScheduler};
//!
//! let config = SyncConfig::load(None)?;
//! let remote = Arc::new(HttpRemoteApi::from_settings(&config.remote)?);
//! let engine = SyncEngine::new(db.clone(), remote, EngineOptions::from_config(&config));
//!
//! let (scheduler, handle) = SyncScheduler::new(engine, db.clone(), config.schedule.clone());
//! tokio::spawn(scheduler.run());
//!
//! let queue = SyncQueue::new(db).with_scheduler(handle.clone());
//! queue.record_batch_opened(&batch).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod remote;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DeviceConfig, EngineSettings, RemoteSettings, ScheduleSettings, SyncConfig};
pub use engine::{BlockedCommand, EngineOptions, EngineState, RunOutcome, RunReport, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use handlers::{CommandHandlers, HandlerError};
pub use queue::SyncQueue;
pub use remote::{HttpRemoteApi, RemoteApi, RemoteError};
pub use scheduler::{NoOpEmitter, SchedulerHandle, SyncEventEmitter, SyncScheduler, SyncStatus};
