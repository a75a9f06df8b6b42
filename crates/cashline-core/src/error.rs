//! # Error Types
//!
//! Domain errors for cashline-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cashline-core (this file)                                             │
//! │  ├── CoreError        - Rule violations (backward transitions, ...)    │
//! │  └── ValidationError  - Malformed input (missing command references)   │
//! │                                                                         │
//! │  cashline-db                                                           │
//! │  └── DbError          - Storage failures                               │
//! │                                                                         │
//! │  cashline-sync                                                         │
//! │  ├── HandlerError     - Recorded on the failed command                 │
//! │  └── SyncError        - Fatal to one engine invocation                 │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → scheduler / worker    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::CommandType;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status update would move a record backwards.
    ///
    /// ## When This Occurs
    /// - Re-opening a batch that is already closed on the backend
    /// - Any write that would undo a sync
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// A command is missing one of the references its handler needs.
    ///
    /// ```text
    /// NewCommand { command_type: CreateOrder, order_id: None, .. }
    ///      │
    ///      ▼
    /// MissingReference { command_type: CreateOrder, field: "order_id" }
    /// ```
    #[error("{command_type} command requires {field}")]
    MissingReference {
        command_type: CommandType,
        field: String,
    },

    /// Value must be zero or positive.
    #[error("{field} must not be negative")]
    Negative { field: String },

    /// Value must be strictly positive.
    #[error("{field} must be greater than zero")]
    NotPositive { field: String },
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
