//! Key-value persistence for registry and pin state.
//!
//! The in-memory registry is the source of truth for serving traffic; the
//! store only provides best-effort durability across restarts.

use async_trait::async_trait;
use gslb_common::GslbError;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

use crate::config::{StoreBackend, StoreConfig};

mod memory;
mod persist;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::persist::{PERSIST_QUEUE_CAPACITY, Persister, STORE_OP_TIMEOUT, bounded};
pub use self::redis_store::RedisStore;

/// Buffered events per watcher before the forwarder applies backpressure
const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Storage backend consumed by the registry and agent authentication
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GslbError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), GslbError>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), GslbError>;

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, GslbError>;

    /// Stream of changes under `prefix`; ends when the store is closed
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, GslbError>;

    async fn close(&self) -> Result<(), GslbError>;

    /// Connectivity probe for readiness checks
    async fn ping(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str;
}

/// Open the configured store backend
pub async fn open(config: &StoreConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis_url).await?),
    };
    Ok(store)
}

/// Local fan-out of write notifications to prefix-filtered watchers.
pub(crate) struct WatchHub {
    sender: Mutex<Option<broadcast::Sender<WatchEvent>>>,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub(crate) fn publish(&self, event: WatchEvent) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = sender.as_ref() {
            // No receivers is fine
            let _ = sender.send(event);
        }
    }

    pub(crate) fn subscribe(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, GslbError> {
        let mut events = {
            let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            match sender.as_ref() {
                Some(sender) => sender.subscribe(),
                None => return Err(GslbError::Store("store closed".to_string())),
            }
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !event.key().starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(prefix = %prefix, missed, "Store watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    pub(crate) fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose every call never completes
    pub(crate) struct HangingStore;

    #[async_trait]
    impl KvStore for HangingStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, GslbError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), GslbError> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<(), GslbError> {
            std::future::pending().await
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<KvPair>, GslbError> {
            std::future::pending().await
        }

        async fn watch(&self, _prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, GslbError> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), GslbError> {
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "hanging"
        }
    }
}
