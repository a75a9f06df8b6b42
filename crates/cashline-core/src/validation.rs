//! # Validation Module
//!
//! Rules checked before anything is written to the queue or to a record.
//!
//! ## Where Each Rule Runs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Enqueue API (cashline-sync)                                           │
//! │  └── validate_new_command: references required by the command type     │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Repositories (cashline-db)                                            │
//! │  └── ensure_forward: status writes never move a record backwards       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  SQLite                                                                │
//! │  ├── UNIQUE(sequence)                                                  │
//! │  ├── CHECK constraints on status columns                               │
//! │  └── Foreign keys between batches / orders / refunds                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{CommandType, MonotonicStatus, NewCommand};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Command References
// =============================================================================

/// Checks that a command carries the references its handler will read.
///
/// ## Required References
/// ```text
/// open_batch     → batch_id
/// create_order   → order_id, batch_id
/// close_batch    → batch_id
/// create_refund  → refund_id
/// ```
///
/// ## Example
/// ```rust
/// use cashline_core::validation::validate_new_command;
/// use cashline_core::NewCommand;
///
/// assert!(validate_new_command(&NewCommand::open_batch("b-1")).is_ok());
///
/// let mut broken = NewCommand::open_batch("b-1");
/// broken.batch_id = None;
/// assert!(validate_new_command(&broken).is_err());
/// ```
pub fn validate_new_command(command: &NewCommand) -> ValidationResult<()> {
    let ty = command.command_type;
    match ty {
        CommandType::OpenBatch | CommandType::CloseBatch => {
            require_reference(ty, "batch_id", command.batch_id.as_deref())
        }
        CommandType::CreateOrder => {
            require_reference(ty, "order_id", command.order_id.as_deref())?;
            require_reference(ty, "batch_id", command.batch_id.as_deref())
        }
        CommandType::CreateRefund => {
            require_reference(ty, "refund_id", command.refund_id.as_deref())
        }
    }
}

fn require_reference(
    command_type: CommandType,
    field: &str,
    value: Option<&str>,
) -> ValidationResult<()> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::MissingReference {
            command_type,
            field: field.to_string(),
        }),
    }
}

// =============================================================================
// Amounts
// =============================================================================

/// Validates that a cash amount is not negative.
pub fn validate_cash_amount(field: &str, cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::Negative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates that an amount is strictly positive (refunds).
pub fn validate_positive_amount(field: &str, cents: i64) -> ValidationResult<()> {
    if cents <= 0 {
        return Err(ValidationError::NotPositive {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Status Transitions
// =============================================================================

/// Refuses a status write that would move a record backwards.
///
/// Staying on the same status is allowed so that a replayed handler can
/// rewrite what an earlier attempt already stored.
pub fn ensure_forward<S: MonotonicStatus>(
    entity: &str,
    id: &str,
    from: S,
    to: S,
) -> CoreResult<()> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            entity: entity.to_string(),
            id: id.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}
