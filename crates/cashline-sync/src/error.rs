//! # Sync Error Types
//!
//! Errors that end an engine invocation or stop the worker from starting.
//!
//! Failures of a single command are NOT here: those are
//! [`HandlerError`](crate::handlers::HandlerError)s, recorded on the command
//! and reported as a `blocked` run.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Storage      │  │     Enqueue             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  DatabaseError  │  │  Validation             │ │
//! │  │  MissingDeviceId│  │  (queue, lock,  │  │  (missing reference)    │ │
//! │  │  InvalidUrl     │  │   sequencer)    │  │  NotRequeueable         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Remote       │  │    Internal     │                              │
//! │  │  client setup   │  │  ShuttingDown   │                              │
//! │  │                 │  │  ChannelError   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use cashline_core::ValidationError;
use cashline_db::DbError;
use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (it is the lease owner identity).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid backend URL.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The queue, lock or sequencer could not be read or written.
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),

    // =========================================================================
    // Enqueue Errors
    // =========================================================================
    /// A command was rejected before it reached the queue.
    #[error("Invalid command: {0}")]
    Validation(#[from] ValidationError),

    /// Requeue asked for a command that is not `failed`.
    #[error("Command {id} is {status}, only failed commands can be requeued")]
    NotRequeueable { id: String, status: String },

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote client could not be built or reached outside a handler.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Scheduler is shutting down.
    #[error("Sync scheduler is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if a later invocation may succeed without intervention.
    ///
    /// ## Retryable Errors
    /// - Storage hiccups (busy database, exhausted pool)
    /// - Remote transport failures
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Rejected commands
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::DatabaseError(db) => !matches!(
                db,
                DbError::MigrationFailed(_) | DbError::Validation(_)
            ),
            SyncError::Remote(remote) => remote.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::DatabaseError(DbError::PoolExhausted).is_retryable());
        assert!(SyncError::Remote(RemoteError::Transport("reset".into())).is_retryable());

        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::MissingDeviceId.is_retryable());
        assert!(!SyncError::DatabaseError(DbError::MigrationFailed("x".into())).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidUrl("ftp://x".into()).is_config_error());
        assert!(SyncError::MissingDeviceId.is_config_error());
        assert!(!SyncError::ShuttingDown.is_config_error());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::from(DbError::not_found("SyncCommand", "c-1"));
        assert_eq!(err.to_string(), "Database error: SyncCommand not found: c-1");
    }
}
