//! # Sync Engine
//!
//! One invocation drains the command queue in sequence order while holding
//! the lease lock.
//!
//! ## Invocation State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ACQUIRING_LOCK ──(held by someone else)──► LOCK_UNAVAILABLE           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  RECOVERING        running → pending (attempts + 1)                    │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  DRAINING ◄──────────────┐                                             │
//! │        │                 │ done                                        │
//! │        ├── head command ─┘                                             │
//! │        │                                                                │
//! │        ├── head fails / parked ──────────────► BLOCKED                 │
//! │        │                                                                │
//! │        ├── lease renewal refused ────────────► LOCK_LOST               │
//! │        │                                                                │
//! │        └── queue empty ──────────────────────► SUCCEEDED               │
//! │                                                                         │
//! │  The lease is released last, whatever the outcome.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The head is the lowest-sequence command that is `pending` or `failed`. A
//! failed head is retried by the next invocation; nothing behind it runs
//! until it succeeds. Once its attempts reach `max_attempts` it is parked
//! until an operator requeues it.
//!
//! The lease is renewed before and after every dispatch. If a renewal is
//! refused another worker has taken the lease over: the run stops without
//! writing the command's status, and the new holder's recovery picks it up.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::handlers::CommandHandlers;
use crate::remote::RemoteApi;
use cashline_core::{
    CommandStatus, CommandType, SyncCommand, DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS,
};
use cashline_db::Database;

// =============================================================================
// States & Reports
// =============================================================================

/// Where an invocation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    AcquiringLock,
    Recovering,
    Draining,
    Succeeded,
    Blocked,
    LockUnavailable,
    LockLost,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::AcquiringLock => "acquiring_lock",
            EngineState::Recovering => "recovering",
            EngineState::Draining => "draining",
            EngineState::Succeeded => "succeeded",
            EngineState::Blocked => "blocked",
            EngineState::LockUnavailable => "lock_unavailable",
            EngineState::LockLost => "lock_lost",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue is empty.
    Succeeded,
    /// A command failed (or is parked); later commands were not touched.
    Blocked,
    /// Another worker holds the lease. Not an error.
    LockUnavailable,
    /// The lease was taken over mid-run; this worker stopped draining.
    LockLost,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Blocked => "blocked",
            RunOutcome::LockUnavailable => "lock_unavailable",
            RunOutcome::LockLost => "lock_lost",
        }
    }
}

impl From<RunOutcome> for EngineState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => EngineState::Succeeded,
            RunOutcome::Blocked => EngineState::Blocked,
            RunOutcome::LockUnavailable => EngineState::LockUnavailable,
            RunOutcome::LockLost => EngineState::LockLost,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The command that stopped a blocked run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedCommand {
    pub command_id: String,
    pub sequence: i64,
    pub command_type: CommandType,
    pub attempts: i64,
    pub error: Option<String>,
    /// True when the command hit `max_attempts` and was not dispatched.
    pub parked: bool,
}

/// Summary of one invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Commands completed by this invocation.
    pub processed: u32,
    /// `running` commands reset by crash recovery.
    pub recovered: u64,
    pub blocked_on: Option<BlockedCommand>,
    /// Finished commands removed by retention cleanup.
    pub cleaned_up: u64,
    pub duration: Duration,
}

impl RunReport {
    fn new(outcome: RunOutcome) -> Self {
        RunReport {
            outcome,
            processed: 0,
            recovered: 0,
            blocked_on: None,
            cleaned_up: 0,
            duration: Duration::ZERO,
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Lease owner identity (the device id).
    pub owner: String,
    pub lock_timeout: Duration,
    /// 0 = retry forever.
    pub max_attempts: u32,
    /// 0 = keep finished commands.
    pub retention_days: u32,
}

impl EngineOptions {
    pub fn new(owner: impl Into<String>) -> Self {
        EngineOptions {
            owner: owner.into(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retention_days: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        EngineOptions {
            owner: config.device_id().to_string(),
            lock_timeout: config.engine.lock_timeout(),
            max_attempts: config.engine.max_attempts,
            retention_days: config.engine.retention_days,
        }
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    fn is_parked(&self, command: &SyncCommand) -> bool {
        self.max_attempts > 0
            && command.status == CommandStatus::Failed
            && command.attempts >= i64::from(self.max_attempts)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Drains the command queue.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    handlers: CommandHandlers,
    options: EngineOptions,
    state: Arc<RwLock<EngineState>>,
}

impl SyncEngine {
    pub fn new(db: Database, remote: Arc<dyn RemoteApi>, options: EngineOptions) -> Self {
        SyncEngine {
            handlers: CommandHandlers::new(db.clone(), remote),
            db,
            options,
            state: Arc::new(RwLock::new(EngineState::Idle)),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// State of the current (or last) invocation.
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    async fn enter(&self, state: EngineState) {
        *self.state.write().await = state;
        debug!(owner = %self.options.owner, state = %state, "Engine state");
    }

    /// Runs one invocation.
    ///
    /// Command failures end the run as [`RunOutcome::Blocked`]; only storage
    /// failures on the queue or the lock come back as `Err`.
    pub async fn run(&self) -> SyncResult<RunReport> {
        let started = Instant::now();
        let owner = self.options.owner.as_str();

        self.enter(EngineState::AcquiringLock).await;
        let acquired = match self
            .db
            .sync_lock()
            .try_acquire(owner, self.options.lock_timeout)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.enter(EngineState::Idle).await;
                return Err(e.into());
            }
        };

        if !acquired {
            info!(owner = %owner, outcome = "lock_unavailable", "Sync skipped, lock held elsewhere");
            self.enter(EngineState::LockUnavailable).await;
            let mut report = RunReport::new(RunOutcome::LockUnavailable);
            report.duration = started.elapsed();
            return Ok(report);
        }

        let result = self.drain().await;

        if let Err(e) = self.db.sync_lock().release(owner).await {
            warn!(owner = %owner, error = %e, "Failed to release sync lock");
        }

        match result {
            Ok(mut report) => {
                report.duration = started.elapsed();
                self.enter(report.outcome.into()).await;
                info!(
                    owner = %owner,
                    outcome = %report.outcome,
                    processed = report.processed,
                    recovered = report.recovered,
                    duration_ms = report.duration.as_millis() as u64,
                    "Sync run finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.enter(EngineState::Idle).await;
                error!(owner = %owner, error = %e, "Sync run aborted");
                Err(e)
            }
        }
    }

    /// Recovery and the drain loop. Runs with the lease held.
    async fn drain(&self) -> SyncResult<RunReport> {
        let commands = self.db.commands();
        let lock = self.db.sync_lock();
        let owner = self.options.owner.as_str();
        let mut report = RunReport::new(RunOutcome::Succeeded);

        self.enter(EngineState::Recovering).await;
        report.recovered = commands.reset_running().await?;

        self.enter(EngineState::Draining).await;
        while let Some(command) = commands.next_dispatchable().await? {
            if self.options.is_parked(&command) {
                warn!(
                    command_id = %command.id,
                    sequence = command.sequence,
                    attempts = command.attempts,
                    "Head command reached max attempts, waiting for requeue"
                );
                report.outcome = RunOutcome::Blocked;
                report.blocked_on = Some(blocked(&command, command.last_error.clone(), true));
                return Ok(report);
            }

            if !lock.renew(owner).await? {
                return Ok(self.lock_lost(report, &command, false));
            }

            commands.mark_running(&command.id).await?;
            debug!(
                command_id = %command.id,
                sequence = command.sequence,
                command_type = %command.command_type,
                "Dispatching command"
            );

            let result = self.handlers.dispatch(&command).await;

            // The command stays `running` for the new holder to recover.
            if !lock.renew(owner).await? {
                return Ok(self.lock_lost(report, &command, true));
            }

            match result {
                Ok(()) => {
                    commands.mark_done(&command.id).await?;
                    report.processed += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    commands.mark_failed(&command.id, &message).await?;
                    error!(
                        command_id = %command.id,
                        sequence = command.sequence,
                        command_type = %command.command_type,
                        error = %message,
                        "Command failed, halting sync"
                    );
                    report.outcome = RunOutcome::Blocked;
                    report.blocked_on = Some(blocked(&command, Some(message), false));
                    return Ok(report);
                }
            }
        }

        if self.options.retention_days > 0 {
            match commands.cleanup_old_entries(self.options.retention_days).await {
                Ok(deleted) => report.cleaned_up = deleted,
                Err(e) => warn!(error = %e, "Retention cleanup failed"),
            }
        }

        Ok(report)
    }

    fn lock_lost(&self, mut report: RunReport, command: &SyncCommand, dispatched: bool) -> RunReport {
        warn!(
            owner = %self.options.owner,
            command_id = %command.id,
            sequence = command.sequence,
            dispatched,
            "Sync lock taken over, stopping drain"
        );
        report.outcome = RunOutcome::LockLost;
        report
    }
}

fn blocked(command: &SyncCommand, error: Option<String>, parked: bool) -> BlockedCommand {
    BlockedCommand {
        command_id: command.id.clone(),
        sequence: command.sequence,
        command_type: command.command_type,
        // The dispatch that just failed counts.
        attempts: if parked {
            command.attempts
        } else {
            command.attempts + 1
        },
        error,
        parked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use crate::testing::{RecordingRemote, RemoteCall};
    use cashline_core::{Batch, BatchSyncStatus, Order, OrderItem, OrderSyncStatus, PaymentMethod};
    use cashline_db::DbConfig;

    async fn setup() -> (Database, Arc<RecordingRemote>, SyncEngine) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(RecordingRemote::new());
        let engine = SyncEngine::new(db.clone(), remote.clone(), EngineOptions::new("device-a"));
        (db, remote, engine)
    }

    async fn open_batch(db: &Database) -> Batch {
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 10_000);
        db.outbox().record_batch_opened(&batch).await.unwrap();
        batch
    }

    async fn ring_up(db: &Database, batch: &Batch, receipt: &str) -> Order {
        let mut order = Order::new(&batch.id, receipt, PaymentMethod::Cash);
        let items = vec![OrderItem::new(&order.id, "p-1", "COLA", "Cola", 150, 2, 25)];
        order.apply_items(&items);
        db.outbox().record_order(&order, &items).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_end_to_end_open_order_close() {
        let (db, remote, engine) = setup().await;
        let batch = open_batch(&db).await;
        let order = ring_up(&db, &batch, "R-0001").await;
        db.outbox()
            .record_batch_closed(&batch.id, 10_325)
            .await
            .unwrap();

        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.processed, 3);
        assert_eq!(engine.state().await, EngineState::Succeeded);

        let stats = db.commands().stats().await.unwrap();
        assert_eq!((stats.done, stats.outstanding()), (3, 0));

        let stored = db.batches().get_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, BatchSyncStatus::SyncedClosed);
        let stored = db.orders().get_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, OrderSyncStatus::Synced);

        assert_eq!(
            remote.calls(),
            vec![
                RemoteCall::OpenBatch(batch.id.clone()),
                RemoteCall::CreateOrder(order.id.clone()),
                RemoteCall::CloseBatch(batch.id.clone()),
            ]
        );

        // Lease released
        assert!(db.sync_lock().current().await.unwrap().is_free());
    }

    #[tokio::test]
    async fn test_commands_replay_in_sequence_order() {
        let (db, remote, engine) = setup().await;
        let batch = open_batch(&db).await;
        let mut expected = vec![RemoteCall::OpenBatch(batch.id.clone())];
        for n in 0..5 {
            let order = ring_up(&db, &batch, &format!("R-{:04}", n)).await;
            expected.push(RemoteCall::CreateOrder(order.id));
        }

        engine.run().await.unwrap();
        assert_eq!(remote.calls(), expected);
    }

    #[tokio::test]
    async fn test_failure_halts_the_run() {
        let (db, remote, engine) = setup().await;
        let batch = open_batch(&db).await;
        let first = ring_up(&db, &batch, "R-0001").await;
        ring_up(&db, &batch, "R-0002").await;

        // Batch already open on the backend: open_batch replays without a call,
        // so the next remote call is the first order.
        db.batches().mark_synced_open(&batch.id, "srv-b").await.unwrap();
        remote.fail_next(RemoteError::Timeout);

        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Blocked);
        assert_eq!(report.processed, 1);
        assert_eq!(engine.state().await, EngineState::Blocked);

        let blocked_on = report.blocked_on.unwrap();
        assert_eq!(blocked_on.sequence, 2);
        assert_eq!(blocked_on.attempts, 1);
        assert!(!blocked_on.parked);
        assert_eq!(remote.calls(), vec![RemoteCall::CreateOrder(first.id.clone())]);

        let failed = db
            .commands()
            .get_by_id(&blocked_on.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("remote call failed: request timed out")
        );

        // The third command was never touched
        let third = db.commands().list(10).await.unwrap().remove(2);
        assert_eq!(third.status, CommandStatus::Pending);
        assert_eq!(third.attempts, 0);

        // Next run retries the failed head first, then continues
        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.processed, 2);
        let retried = db
            .commands()
            .get_by_id(&blocked_on.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, CommandStatus::Done);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn test_dependency_enforced_without_open() {
        let (db, remote, engine) = setup().await;

        // Order queued for a batch whose open was never queued
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.batches().insert(&batch).await.unwrap();
        let order = ring_up(&db, &batch, "R-0001").await;

        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Blocked);
        assert!(remote.calls().is_empty());

        let cmd = db.commands().list(1).await.unwrap().remove(0);
        assert_eq!(cmd.order_id.as_deref(), Some(order.id.as_str()));
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert!(cmd.last_error.unwrap().contains("expected synced_open"));
    }

    #[tokio::test]
    async fn test_crash_recovery_does_not_duplicate_remote_effects() {
        let (db, remote, engine) = setup().await;
        let batch = open_batch(&db).await;
        let cmd = db.commands().list(1).await.unwrap().remove(0);

        // A previous worker called the backend and died before marking done
        db.commands().mark_running(&cmd.id).await.unwrap();
        db.batches().mark_synced_open(&batch.id, "srv-b").await.unwrap();

        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.processed, 1);
        assert!(remote.calls().is_empty());

        let done = db.commands().get_by_id(&cmd.id).await.unwrap().unwrap();
        assert_eq!(done.status, CommandStatus::Done);
        // One for the recovery, one for the dispatch
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn test_lock_unavailable_is_not_an_error() {
        let (db, remote, engine) = setup().await;
        open_batch(&db).await;

        assert!(db
            .sync_lock()
            .try_acquire("device-b", Duration::from_secs(300))
            .await
            .unwrap());

        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::LockUnavailable);
        assert!(remote.calls().is_empty());
        assert_eq!(db.commands().pending_count().await.unwrap(), 1);

        // The other holder keeps its lease
        let lock = db.sync_lock().current().await.unwrap();
        assert_eq!(lock.locked_by.as_deref(), Some("device-b"));
    }

    #[tokio::test]
    async fn test_taken_over_lease_stops_the_drain() {
        let (db, remote_a, engine_a) = setup().await;
        let batch = open_batch(&db).await;
        let order = ring_up(&db, &batch, "R-0001").await;

        // device-b takes the lease while device-a is waiting on the backend
        remote_a.take_lease_during_next_call(&db, "device-b");
        let report = engine_a.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::LockLost);
        assert_eq!(report.processed, 0);
        assert_eq!(engine_a.state().await, EngineState::LockLost);
        assert_eq!(remote_a.calls(), vec![RemoteCall::OpenBatch(batch.id.clone())]);

        // device-a wrote nothing after losing the lease and left device-b's lease alone
        let queued = db.commands().list(10).await.unwrap();
        assert_eq!(queued[0].status, CommandStatus::Running);
        assert_eq!(queued[1].status, CommandStatus::Pending);
        assert_eq!(queued[1].attempts, 0);
        let lock = db.sync_lock().current().await.unwrap();
        assert_eq!(lock.locked_by.as_deref(), Some("device-b"));

        // device-b's own run recovers the in-flight command without a second open
        assert!(db.sync_lock().release("device-b").await.unwrap());
        let remote_b = Arc::new(RecordingRemote::new());
        let engine_b = SyncEngine::new(db.clone(), remote_b.clone(), EngineOptions::new("device-b"));
        let report = engine_b.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.processed, 2);
        assert_eq!(remote_b.calls(), vec![RemoteCall::CreateOrder(order.id.clone())]);
    }

    #[tokio::test]
    async fn test_parked_after_max_attempts_until_requeued() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(RecordingRemote::new());
        let engine = SyncEngine::new(
            db.clone(),
            remote.clone(),
            EngineOptions::new("device-a").max_attempts(2),
        );
        open_batch(&db).await;
        remote.fail_always("connection refused");

        assert_eq!(engine.run().await.unwrap().outcome, RunOutcome::Blocked);
        assert_eq!(engine.run().await.unwrap().outcome, RunOutcome::Blocked);
        assert_eq!(remote.calls().len(), 2);

        // Third run does not dispatch
        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Blocked);
        let parked = report.blocked_on.unwrap();
        assert!(parked.parked);
        assert_eq!(parked.attempts, 2);
        assert_eq!(remote.calls().len(), 2);

        remote.recover();
        assert!(db.commands().requeue(&parked.command_id).await.unwrap());

        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_succeeds() {
        let (db, _remote, engine) = setup().await;
        let report = engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.processed, 0);
        assert!(db.sync_lock().current().await.unwrap().is_free());
    }

    #[tokio::test]
    async fn test_options_from_config() {
        let mut config = SyncConfig::default();
        config.device.id = "register-7".into();
        config.engine.max_attempts = 0;

        let options = EngineOptions::from_config(&config);
        assert_eq!(options.owner, "register-7");
        assert_eq!(options.lock_timeout, Duration::from_secs(300));
        assert_eq!(options.retention_days, 30);

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        open_batch(&db).await;
        let mut failed = db.commands().list(1).await.unwrap().remove(0);
        failed.status = CommandStatus::Failed;
        failed.attempts = 1_000;

        // 0 never parks
        assert!(!options.is_parked(&failed));
        failed.attempts = 10;
        assert!(EngineOptions::new("x").is_parked(&failed));
        failed.attempts = 9;
        assert!(!EngineOptions::new("x").is_parked(&failed));
    }
}
