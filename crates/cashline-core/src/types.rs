//! # Domain Types
//!
//! Records the sync engine reads and writes, and the command queue model.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Batch       │   │     Order       │   │     Refund      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │◄──│  batch_id (FK)  │◄──│  order_id (FK)  │       │
//! │  │  starting cash  │   │  totals, items  │   │  amount_cents   │       │
//! │  │  sync_status    │   │  sync_status    │   │  sync_status    │       │
//! │  │  remote_id      │   │  remote_id      │   │  remote_id      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────┐     │
//! │  │                        SyncCommand                            │     │
//! │  │  sequence (total order) │ command_type │ status │ attempts    │     │
//! │  │  batch_id? order_id? refund_id? │ last_error │ created_at     │     │
//! │  └───────────────────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Machines
//! All sync statuses only move forward:
//! ```text
//! Batch:   local_only ──► synced_open ──► synced_closed
//! Order:   local_only ──► synced
//! Refund:  pending    ──► synced
//! Command: pending ──► running ──► done | failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a new record identifier (UUID v4).
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Monotonic Status
// =============================================================================

/// A one-directional status machine.
///
/// Statuses are ranked; a record may stay where it is or move to a higher
/// rank, never back.
pub trait MonotonicStatus: Copy + PartialEq {
    /// Position of this status in the machine (0 = initial).
    fn rank(&self) -> u8;

    /// Stored/serialized name of the status.
    fn as_str(&self) -> &'static str;

    /// Returns true if moving from `self` to `next` does not go backwards.
    fn can_advance_to(&self, next: Self) -> bool {
        next.rank() >= self.rank()
    }

    /// Returns true if this status is `target` or past it.
    fn has_reached(&self, target: Self) -> bool {
        self.rank() >= target.rank()
    }
}

// =============================================================================
// Batch
// =============================================================================

/// Sync status of a cash batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum BatchSyncStatus {
    /// Recorded on this device only.
    #[default]
    LocalOnly,
    /// Opened on the backend.
    SyncedOpen,
    /// Closed on the backend.
    SyncedClosed,
}

impl MonotonicStatus for BatchSyncStatus {
    fn rank(&self) -> u8 {
        match self {
            BatchSyncStatus::LocalOnly => 0,
            BatchSyncStatus::SyncedOpen => 1,
            BatchSyncStatus::SyncedClosed => 2,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            BatchSyncStatus::LocalOnly => "local_only",
            BatchSyncStatus::SyncedOpen => "synced_open",
            BatchSyncStatus::SyncedClosed => "synced_closed",
        }
    }
}

/// A cash drawer session on one register.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Batch {
    pub id: String,
    pub store_id: String,
    pub user_id: String,
    pub location_id: String,
    pub register_id: String,
    /// Cash in the drawer when the batch was opened.
    pub starting_cash_cents: i64,
    /// Counted cash at close. `None` while the batch is still open locally.
    pub closing_cash_cents: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub sync_status: BatchSyncStatus,
    /// Backend identity, known once the batch has been opened remotely.
    pub remote_id: Option<String>,
    /// Why the last open/close attempt for this batch failed, if it did.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Creates a new locally opened batch.
    pub fn open(
        store_id: impl Into<String>,
        user_id: impl Into<String>,
        location_id: impl Into<String>,
        register_id: impl Into<String>,
        starting_cash_cents: i64,
    ) -> Self {
        let now = Utc::now();
        Batch {
            id: new_record_id(),
            store_id: store_id.into(),
            user_id: user_id.into(),
            location_id: location_id.into(),
            register_id: register_id.into(),
            starting_cash_cents,
            closing_cash_cents: None,
            opened_at: now,
            closed_at: None,
            sync_status: BatchSyncStatus::LocalOnly,
            remote_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the cashier has closed the batch on this device.
    pub fn is_closed_locally(&self) -> bool {
        self.closing_cash_cents.is_some()
    }

    /// Key used when addressing this batch on the backend.
    ///
    /// Falls back to the local id, which the backend accepts as the
    /// idempotency key of the open request.
    pub fn remote_key(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.id)
    }
}

// =============================================================================
// Order
// =============================================================================

/// Sync status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OrderSyncStatus {
    #[default]
    LocalOnly,
    Synced,
}

impl MonotonicStatus for OrderSyncStatus {
    fn rank(&self) -> u8 {
        match self {
            OrderSyncStatus::LocalOnly => 0,
            OrderSyncStatus::Synced => 1,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            OrderSyncStatus::LocalOnly => "local_only",
            OrderSyncStatus::Synced => "synced",
        }
    }
}

/// How the customer paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    /// Card payment on an external terminal.
    ExternalCard,
}

/// An order rung up during a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Order {
    pub id: String,
    pub batch_id: String,
    pub receipt_number: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub payment_method: PaymentMethod,
    pub sync_status: OrderSyncStatus,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates an empty order in `batch_id`. Totals are filled by [`Order::apply_items`].
    pub fn new(
        batch_id: impl Into<String>,
        receipt_number: impl Into<String>,
        payment_method: PaymentMethod,
    ) -> Self {
        let now = Utc::now();
        Order {
            id: new_record_id(),
            batch_id: batch_id.into(),
            receipt_number: receipt_number.into(),
            subtotal_cents: 0,
            tax_cents: 0,
            discount_cents: 0,
            total_cents: 0,
            payment_method,
            sync_status: OrderSyncStatus::LocalOnly,
            remote_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recomputes subtotal, tax and total from the order lines.
    pub fn apply_items(&mut self, items: &[OrderItem]) {
        self.subtotal_cents = items.iter().map(|i| i.line_total_cents).sum();
        self.tax_cents = items.iter().map(|i| i.tax_cents).sum();
        self.total_cents = self.subtotal_cents + self.tax_cents - self.discount_cents;
    }
}

/// A line on an order. Product data is frozen at time of sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    pub sku_snapshot: String,
    pub name_snapshot: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub line_total_cents: i64,
    pub tax_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn new(
        order_id: impl Into<String>,
        product_id: impl Into<String>,
        sku: impl Into<String>,
        name: impl Into<String>,
        unit_price_cents: i64,
        quantity: i64,
        tax_cents: i64,
    ) -> Self {
        OrderItem {
            id: new_record_id(),
            order_id: order_id.into(),
            product_id: product_id.into(),
            sku_snapshot: sku.into(),
            name_snapshot: name.into(),
            unit_price_cents,
            quantity,
            line_total_cents: unit_price_cents * quantity,
            tax_cents,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Refund
// =============================================================================

/// Sync status of a refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum RefundSyncStatus {
    #[default]
    Pending,
    Synced,
}

impl MonotonicStatus for RefundSyncStatus {
    fn rank(&self) -> u8 {
        match self {
            RefundSyncStatus::Pending => 0,
            RefundSyncStatus::Synced => 1,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RefundSyncStatus::Pending => "pending",
            RefundSyncStatus::Synced => "synced",
        }
    }
}

/// Money returned against an earlier order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Refund {
    pub id: String,
    pub order_id: String,
    pub amount_cents: i64,
    pub reason: Option<String>,
    pub sync_status: RefundSyncStatus,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    pub fn new(order_id: impl Into<String>, amount_cents: i64, reason: Option<String>) -> Self {
        let now = Utc::now();
        Refund {
            id: new_record_id(),
            order_id: order_id.into(),
            amount_cents,
            reason,
            sync_status: RefundSyncStatus::Pending,
            remote_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Sync Command
// =============================================================================

/// The kind of work a queued command performs.
///
/// Closed set: the engine matches on it exhaustively, so adding a variant
/// forces a new handler branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    OpenBatch,
    CreateOrder,
    CloseBatch,
    CreateRefund,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::OpenBatch => "open_batch",
            CommandType::CreateOrder => "create_order",
            CommandType::CloseBatch => "close_batch",
            CommandType::CreateRefund => "create_refund",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Waiting to be dispatched.
    Pending,
    /// Dispatched, outcome not yet persisted.
    Running,
    /// Remote effect applied and local status updated.
    Done,
    /// Handler returned an error; blocks the queue until retried.
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Done => "done",
            CommandStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued unit of sync work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncCommand {
    pub id: String,
    /// Total order key, assigned at enqueue time.
    pub sequence: i64,
    pub command_type: CommandType,
    pub status: CommandStatus,
    pub batch_id: Option<String>,
    pub order_id: Option<String>,
    pub refund_id: Option<String>,
    /// Transitions out of pending/running so far.
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A command about to be enqueued.
///
/// Use the per-type constructors; they fill in exactly the references the
/// handler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommand {
    pub command_type: CommandType,
    pub batch_id: Option<String>,
    pub order_id: Option<String>,
    pub refund_id: Option<String>,
}

impl NewCommand {
    pub fn open_batch(batch_id: impl Into<String>) -> Self {
        NewCommand {
            command_type: CommandType::OpenBatch,
            batch_id: Some(batch_id.into()),
            order_id: None,
            refund_id: None,
        }
    }

    pub fn create_order(order_id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        NewCommand {
            command_type: CommandType::CreateOrder,
            batch_id: Some(batch_id.into()),
            order_id: Some(order_id.into()),
            refund_id: None,
        }
    }

    pub fn close_batch(batch_id: impl Into<String>) -> Self {
        NewCommand {
            command_type: CommandType::CloseBatch,
            batch_id: Some(batch_id.into()),
            order_id: None,
            refund_id: None,
        }
    }

    pub fn create_refund(refund_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        NewCommand {
            command_type: CommandType::CreateRefund,
            batch_id: None,
            order_id: Some(order_id.into()),
            refund_id: Some(refund_id.into()),
        }
    }
}

/// Number of commands in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStats {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

impl CommandStats {
    /// Commands that still have to reach the backend.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running + self.failed
    }
}

// =============================================================================
// Sync Lock
// =============================================================================

/// Snapshot of the lease lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncLock {
    pub locked_by: Option<String>,
    /// Acquisition time in epoch milliseconds.
    pub locked_at: Option<i64>,
}

impl SyncLock {
    pub fn is_free(&self) -> bool {
        self.locked_by.is_none()
    }

    /// Returns true if the holder's lease ran out at `now_ms`.
    ///
    /// A holder without an acquisition time is treated as expired.
    pub fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        match self.locked_at {
            Some(at) => now_ms - at > timeout_ms,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_never_moves_back() {
        assert!(BatchSyncStatus::LocalOnly.can_advance_to(BatchSyncStatus::SyncedOpen));
        assert!(BatchSyncStatus::SyncedOpen.can_advance_to(BatchSyncStatus::SyncedClosed));
        assert!(BatchSyncStatus::SyncedOpen.can_advance_to(BatchSyncStatus::SyncedOpen));
        assert!(!BatchSyncStatus::SyncedClosed.can_advance_to(BatchSyncStatus::SyncedOpen));
        assert!(!BatchSyncStatus::SyncedOpen.can_advance_to(BatchSyncStatus::LocalOnly));
    }

    #[test]
    fn test_has_reached() {
        assert!(BatchSyncStatus::SyncedClosed.has_reached(BatchSyncStatus::SyncedOpen));
        assert!(!BatchSyncStatus::LocalOnly.has_reached(BatchSyncStatus::SyncedOpen));
        assert!(OrderSyncStatus::Synced.has_reached(OrderSyncStatus::Synced));
        assert!(!RefundSyncStatus::Pending.has_reached(RefundSyncStatus::Synced));
    }

    #[test]
    fn test_command_constructors_fill_references() {
        let cmd = NewCommand::create_order("o-1", "b-1");
        assert_eq!(cmd.command_type, CommandType::CreateOrder);
        assert_eq!(cmd.order_id.as_deref(), Some("o-1"));
        assert_eq!(cmd.batch_id.as_deref(), Some("b-1"));
        assert!(cmd.refund_id.is_none());

        let cmd = NewCommand::create_refund("r-1", "o-1");
        assert_eq!(cmd.refund_id.as_deref(), Some("r-1"));
        assert!(cmd.batch_id.is_none());
    }

    #[test]
    fn test_lock_expiry() {
        let lock = SyncLock {
            locked_by: Some("worker-a".into()),
            locked_at: Some(1_000),
        };
        assert!(!lock.is_free());
        assert!(!lock.is_expired(1_500, 1_000));
        assert!(!lock.is_expired(2_000, 1_000));
        assert!(lock.is_expired(2_001, 1_000));

        let orphan = SyncLock {
            locked_by: Some("worker-b".into()),
            locked_at: None,
        };
        assert!(orphan.is_expired(0, 1_000));
    }

    #[test]
    fn test_batch_remote_key_falls_back_to_local_id() {
        let mut batch = Batch::open("store", "user", "loc", "reg", 10_000);
        assert_eq!(batch.remote_key(), batch.id);
        batch.remote_id = Some("srv-42".into());
        assert_eq!(batch.remote_key(), "srv-42");
    }

    #[test]
    fn test_order_totals_from_items() {
        let mut order = Order::new("b-1", "R-0001", PaymentMethod::Cash);
        let items = vec![
            OrderItem::new(&order.id, "p-1", "COKE", "Coke 330ml", 150, 2, 25),
            OrderItem::new(&order.id, "p-2", "CHIPS", "Chips", 300, 1, 25),
        ];
        order.apply_items(&items);
        assert_eq!(order.subtotal_cents, 600);
        assert_eq!(order.tax_cents, 50);
        assert_eq!(order.total_cents, 650);
    }

    #[test]
    fn test_stats_outstanding() {
        let stats = CommandStats {
            pending: 2,
            running: 1,
            done: 10,
            failed: 1,
        };
        assert_eq!(stats.outstanding(), 4);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&CommandType::CreateRefund).ok(),
            Some("\"create_refund\"".to_string())
        );
    }
}
