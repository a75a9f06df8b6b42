//! # Sync Scheduler
//!
//! Runs the engine on an interval and on demand, backing off while the queue
//! is blocked.
//!
//! ## Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   tokio::select! {                                                     │
//! │     interval.tick()      → run (unless backing off / polling disabled) │
//! │     trigger_rx.recv()    → run (unless backing off)                    │
//! │     sleep_until(retry)   → run (backoff elapsed)                       │
//! │     shutdown_rx.recv()   → stop                                        │
//! │   }                                                                    │
//! │                                                                         │
//! │   After a run:                                                         │
//! │     succeeded / lock_unavailable / lock_lost → backoff reset           │
//! │     blocked / engine error       → retry after next backoff delay      │
//! │                                    (initial_backoff_ms × 2ⁿ, capped    │
//! │                                     at max_backoff_secs, jittered)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ScheduleSettings;
use crate::engine::{RunOutcome, RunReport, SyncEngine};
use crate::error::{SyncError, SyncResult};
use cashline_db::Database;

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the scheduler for status displays.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    /// An engine invocation is in progress.
    pub running: bool,

    /// Outcome of the last completed invocation.
    pub last_outcome: Option<RunOutcome>,

    /// When the last invocation finished.
    pub last_run_at: Option<DateTime<Utc>>,

    /// When the queue was last drained completely.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Commands waiting to be replayed.
    pub pending_count: i64,

    /// Commands in `failed`.
    pub failed_count: i64,

    /// Commands completed since the scheduler started.
    pub total_processed: u64,

    /// Error of the blocking command or the aborted run.
    pub last_error: Option<String>,

    /// Blocked or aborted runs in a row.
    pub consecutive_failures: u32,

    /// Number of invocations since the scheduler started.
    pub runs: u64,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives scheduler events (status bar, tray icon...).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync status change event.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a sync progress event.
    fn emit_progress(&self, pending: i64, synced: i64);

    /// Emits a sync error event.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: i64, _synced: i64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Backoff
// =============================================================================

/// Delay policy between runs.
pub(crate) struct RunBackoff {
    backoff: ExponentialBackoff,
    max: Duration,
}

impl RunBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        RunBackoff {
            backoff: ExponentialBackoff {
                initial_interval: initial,
                max_interval: max,
                multiplier: 2.0,
                max_elapsed_time: None,
                ..Default::default()
            },
            max,
        }
    }

    /// Delay before retrying after a blocked or aborted run.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.backoff.next_backoff().unwrap_or(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.backoff.reset();
    }
}

// =============================================================================
// Scheduler Handle
// =============================================================================

/// Handle for triggering and stopping a running [`SyncScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SchedulerHandle {
    /// Requests a run as soon as possible.
    ///
    /// Triggers coalesce: one already waiting covers this one.
    pub fn trigger(&self) -> SyncResult<()> {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SyncError::ShuttingDown),
        }
    }

    /// Gets the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Signals the scheduler to stop after the current run.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives [`SyncEngine`] invocations.
pub struct SyncScheduler {
    engine: SyncEngine,
    db: Database,
    settings: ScheduleSettings,
    emitter: Arc<dyn SyncEventEmitter>,
    status: Arc<RwLock<SyncStatus>>,
    backoff: RunBackoff,
    retry_at: Option<Instant>,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl SyncScheduler {
    /// Creates a new scheduler and returns a handle.
    pub fn new(
        engine: SyncEngine,
        db: Database,
        settings: ScheduleSettings,
    ) -> (Self, SchedulerHandle) {
        Self::with_emitter(engine, db, settings, Arc::new(NoOpEmitter))
    }

    /// Creates a new scheduler with a custom event emitter.
    pub fn with_emitter(
        engine: SyncEngine,
        db: Database,
        settings: ScheduleSettings,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> (Self, SchedulerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let status = Arc::new(RwLock::new(SyncStatus::default()));

        let backoff = RunBackoff::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
        );

        let scheduler = SyncScheduler {
            engine,
            db,
            settings,
            emitter,
            status: status.clone(),
            backoff,
            retry_at: None,
            trigger_rx,
            shutdown_rx,
        };

        let handle = SchedulerHandle {
            trigger_tx,
            shutdown_tx,
            status,
        };

        (scheduler, handle)
    }

    /// Runs the scheduler loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(
            poll_enabled = self.settings.enabled,
            poll_interval_secs = self.settings.poll_interval_secs,
            "Sync scheduler starting"
        );

        let poll_interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll_enabled = self.settings.enabled;

        loop {
            let retry_deadline = self.retry_at.unwrap_or_else(Instant::now);
            let backing_off = self.retry_at.is_some();

            tokio::select! {
                // Poll on interval
                _ = interval.tick(), if poll_enabled => {
                    if backing_off {
                        debug!("Backing off, skipping scheduled run");
                    } else {
                        self.run_once().await;
                    }
                }

                // Explicit trigger (e.g. after an enqueue)
                Some(()) = self.trigger_rx.recv() => {
                    if backing_off {
                        debug!("Backing off, ignoring trigger");
                    } else {
                        self.run_once().await;
                    }
                }

                // Backoff elapsed
                _ = tokio::time::sleep_until(retry_deadline), if backing_off => {
                    self.retry_at = None;
                    self.run_once().await;
                }

                // Shutdown
                _ = self.shutdown_rx.recv() => {
                    info!("Sync scheduler shutting down");
                    break;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// One engine invocation plus status bookkeeping.
    async fn run_once(&mut self) {
        self.update_status(|s| s.running = true).await;

        match self.engine.run().await {
            Ok(report) => self.after_report(&report).await,
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Sync run failed");
                self.emitter.emit_error(&message, e.is_retryable());
                self.schedule_retry();
                self.update_status(|s| {
                    s.last_outcome = None;
                    s.last_error = Some(message);
                    s.consecutive_failures += 1;
                })
                .await;
            }
        }

        self.refresh_counts().await;
        let now = Utc::now();
        let snapshot = self
            .update_status(|s| {
                s.running = false;
                s.runs += 1;
                s.last_run_at = Some(now);
            })
            .await;
        self.emitter.emit_status(&snapshot);
    }

    async fn after_report(&mut self, report: &RunReport) {
        match report.outcome {
            RunOutcome::Succeeded | RunOutcome::LockUnavailable | RunOutcome::LockLost => {
                self.backoff.reset();
                self.retry_at = None;
            }
            RunOutcome::Blocked => self.schedule_retry(),
        }

        let blocked_error = report.blocked_on.as_ref().map(|b| {
            let detail = b.error.clone().unwrap_or_else(|| "unknown error".into());
            format!("{} #{}: {}", b.command_type, b.sequence, detail)
        });
        if let (Some(message), Some(blocked)) = (&blocked_error, &report.blocked_on) {
            self.emitter.emit_error(message, !blocked.parked);
        }

        let outcome = report.outcome;
        let processed = report.processed;
        self.update_status(|s| {
            s.last_outcome = Some(outcome);
            s.total_processed += u64::from(processed);
            match outcome {
                RunOutcome::Succeeded => {
                    s.last_success_at = Some(Utc::now());
                    s.last_error = None;
                    s.consecutive_failures = 0;
                }
                RunOutcome::Blocked => {
                    s.last_error = blocked_error;
                    s.consecutive_failures += 1;
                }
                RunOutcome::LockUnavailable | RunOutcome::LockLost => {}
            }
        })
        .await;
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        warn!(delay_ms = delay.as_millis() as u64, "Sync blocked, backing off");
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn refresh_counts(&self) {
        match self.db.commands().stats().await {
            Ok(stats) => {
                self.update_status(|s| {
                    s.pending_count = stats.pending;
                    s.failed_count = stats.failed;
                })
                .await;
                self.emitter.emit_progress(stats.outstanding(), stats.done);
            }
            Err(e) => debug!(error = %e, "Could not read queue stats"),
        }
    }

    async fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) -> SyncStatus {
        let mut status = self.status.write().await;
        f(&mut status);
        status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::testing::RecordingRemote;
    use cashline_core::Batch;
    use cashline_db::DbConfig;

    fn settings(initial_backoff_ms: u64) -> ScheduleSettings {
        ScheduleSettings {
            enabled: true,
            poll_interval_secs: 3600,
            initial_backoff_ms,
            max_backoff_secs: 300,
        }
    }

    async fn wait_until(
        handle: &SchedulerHandle,
        done: impl Fn(&SyncStatus) -> bool,
    ) -> SyncStatus {
        for _ in 0..500 {
            let status = handle.status().await;
            if !status.running && done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler status never matched: {:?}", handle.status().await);
    }

    async fn wait_for_runs(handle: &SchedulerHandle, runs: u64) -> SyncStatus {
        wait_until(handle, |s| s.runs >= runs).await
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = RunBackoff::new(Duration::from_millis(1000), Duration::from_secs(8));

        // Jitter keeps each delay within ±50% of the current interval
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_secs(4) && capped <= Duration::from_secs(12));

        backoff.reset();
        let again = backoff.next_delay();
        assert!(again <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_initial_tick_and_trigger_run_engine() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(RecordingRemote::new());
        let engine = SyncEngine::new(db.clone(), remote.clone(), EngineOptions::new("device-a"));
        let (scheduler, handle) = SyncScheduler::new(engine, db.clone(), settings(1000));
        let task = tokio::spawn(scheduler.run());

        // First interval tick fires immediately on an empty queue
        let status = wait_for_runs(&handle, 1).await;
        assert_eq!(status.last_outcome, Some(RunOutcome::Succeeded));

        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.outbox().record_batch_opened(&batch).await.unwrap();
        handle.trigger().unwrap();

        let status = wait_for_runs(&handle, 2).await;
        assert_eq!(status.last_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(status.total_processed, 1);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_success_at.is_some());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.trigger(), Err(SyncError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_blocked_run_backs_off_then_retries() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(RecordingRemote::new());
        let batch = Batch::open("store-1", "cashier-1", "front", "reg-1", 0);
        db.outbox().record_batch_opened(&batch).await.unwrap();
        remote.fail_always("connection refused");

        let engine = SyncEngine::new(db.clone(), remote.clone(), EngineOptions::new("device-a"));
        let (scheduler, handle) = SyncScheduler::new(engine, db.clone(), settings(50));
        let task = tokio::spawn(scheduler.run());

        let status = wait_for_runs(&handle, 1).await;
        assert_eq!(status.last_outcome, Some(RunOutcome::Blocked));
        assert_eq!(status.failed_count, 1);
        assert!(status
            .last_error
            .as_deref()
            .unwrap()
            .contains("connection refused"));

        // Backoff elapses without a tick or trigger
        remote.recover();
        let status = wait_until(&handle, |s| s.last_outcome == Some(RunOutcome::Succeeded)).await;
        assert!(status.runs >= 2);
        assert_eq!(status.last_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_error, None);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
