//! Write-behind persistence.
//!
//! Callers enqueue writes while holding their own locks, so the store sees
//! them in mutation order, but never wait on the store itself. A single task
//! applies the queue, bounding every round-trip with a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use gslb_common::GslbError;

use super::KvStore;

/// Pending writes before new ones are dropped
pub const PERSIST_QUEUE_CAPACITY: usize = 4096;

/// Upper bound on a single store round-trip
pub const STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a store operation, failing with `GslbError::Store` once `limit` passes
pub async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, GslbError>
where
    F: Future<Output = Result<T, GslbError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(GslbError::Store(format!(
            "store operation timed out after {limit:?}"
        ))),
    }
}

enum PersistOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    Flush(oneshot::Sender<()>),
}

/// Handle to the background writer; the task exits once every handle is dropped
pub struct Persister {
    queue: mpsc::Sender<PersistOp>,
}

impl Persister {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn KvStore>, capacity: usize, op_timeout: Duration) -> Self {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run(store, rx, op_timeout));
        Self { queue }
    }

    pub fn put(&self, key: String, value: Vec<u8>) {
        self.enqueue(PersistOp::Put { key, value });
    }

    pub fn delete(&self, key: String) {
        self.enqueue(PersistOp::Delete { key });
    }

    /// Wait until every write enqueued so far has been applied or given up on
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.queue.send(PersistOp::Flush(ack)).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    fn enqueue(&self, op: PersistOp) {
        match self.queue.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(op)) => {
                warn!(key = op_key(&op), "Persistence queue full, dropping write");
            }
            Err(mpsc::error::TrySendError::Closed(op)) => {
                warn!(key = op_key(&op), "Persistence writer gone, dropping write");
            }
        }
    }
}

fn op_key(op: &PersistOp) -> &str {
    match op {
        PersistOp::Put { key, .. } | PersistOp::Delete { key } => key,
        PersistOp::Flush(_) => "",
    }
}

async fn run(store: Arc<dyn KvStore>, mut queue: mpsc::Receiver<PersistOp>, op_timeout: Duration) {
    while let Some(op) = queue.recv().await {
        match op {
            PersistOp::Put { key, value } => {
                if let Err(e) = bounded(op_timeout, store.set(&key, value)).await {
                    warn!(key = %key, error = %e, "Failed to persist record");
                }
            }
            PersistOp::Delete { key } => {
                if let Err(e) = bounded(op_timeout, store.delete(&key)).await {
                    warn!(key = %key, error = %e, "Failed to delete persisted record");
                }
            }
            PersistOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
