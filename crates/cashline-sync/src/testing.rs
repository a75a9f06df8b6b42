//! In-memory [`RemoteApi`] for engine and handler tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cashline_db::Database;

use crate::remote::{
    CloseBatchRequest, CreateOrderRequest, CreateRefundRequest, OpenBatchRequest, RemoteApi,
    RemoteError, RemoteRecord, RemoteResult,
};

/// One attempted backend call, keyed by the local record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    OpenBatch(String),
    CreateOrder(String),
    CloseBatch(String),
    CreateRefund(String),
}

/// Records every call and hands out `srv-N` ids.
#[derive(Default)]
pub struct RecordingRemote {
    calls: Mutex<Vec<RemoteCall>>,
    orders: Mutex<Vec<CreateOrderRequest>>,
    queued_failures: Mutex<VecDeque<RemoteError>>,
    failing: Mutex<Option<String>>,
    takeover: Mutex<Option<(Database, String)>>,
    next_id: AtomicU64,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next call with `err`.
    pub fn fail_next(&self, err: RemoteError) {
        self.queued_failures.lock().unwrap().push_back(err);
    }

    /// Fails every call with a transport error until [`recover`](Self::recover).
    pub fn fail_always(&self, message: &str) {
        *self.failing.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.failing.lock().unwrap() = None;
    }

    /// During the next call, `owner` takes over the sync lease as a worker
    /// would once the caller's lease has expired.
    pub fn take_lease_during_next_call(&self, db: &Database, owner: &str) {
        *self.takeover.lock().unwrap() = Some((db.clone(), owner.to_string()));
    }

    async fn interfere(&self) {
        let takeover = self.takeover.lock().unwrap().take();
        if let Some((db, owner)) = takeover {
            let later = Utc::now() + chrono::Duration::minutes(10);
            let taken = db
                .sync_lock()
                .try_acquire_at(&owner, Duration::from_secs(300), later)
                .await
                .unwrap();
            assert!(taken);
        }
    }

    /// Every call attempted so far, failed ones included.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_order(&self) -> Option<CreateOrderRequest> {
        self.orders.lock().unwrap().last().cloned()
    }

    fn record(&self, call: RemoteCall) -> RemoteResult<RemoteRecord> {
        self.calls.lock().unwrap().push(call);

        if let Some(err) = self.queued_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(message) = self.failing.lock().unwrap().clone() {
            return Err(RemoteError::Transport(message));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteRecord {
            id: format!("srv-{}", n),
        })
    }
}

#[async_trait]
impl RemoteApi for RecordingRemote {
    async fn open_batch(&self, request: &OpenBatchRequest) -> RemoteResult<RemoteRecord> {
        self.interfere().await;
        self.record(RemoteCall::OpenBatch(request.local_id.clone()))
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> RemoteResult<RemoteRecord> {
        self.interfere().await;
        let record = self.record(RemoteCall::CreateOrder(request.local_id.clone()))?;
        self.orders.lock().unwrap().push(request.clone());
        Ok(record)
    }

    async fn close_batch(&self, _batch_key: &str, request: &CloseBatchRequest) -> RemoteResult<()> {
        self.interfere().await;
        self.record(RemoteCall::CloseBatch(request.local_id.clone()))
            .map(|_| ())
    }

    async fn create_refund(&self, request: &CreateRefundRequest) -> RemoteResult<RemoteRecord> {
        self.interfere().await;
        self.record(RemoteCall::CreateRefund(request.local_id.clone()))
    }
}
