//! In-process store for single-node deployments and tests.

use async_trait::async_trait;
use gslb_common::GslbError;
use std::collections::BTreeMap;
use tokio::sync::{RwLock, mpsc};

use super::{KvPair, KvStore, WatchEvent, WatchHub};

pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    hub: WatchHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            hub: WatchHub::new(),
        }
    }

    fn ensure_open(&self) -> Result<(), GslbError> {
        if self.hub.is_closed() {
            return Err(GslbError::Store("store closed".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GslbError> {
        self.ensure_open()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), GslbError> {
        self.ensure_open()?;
        self.data
            .write()
            .await
            .insert(key.to_string(), value.clone());
        self.hub.publish(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GslbError> {
        self.ensure_open()?;
        if self.data.write().await.remove(key).is_some() {
            self.hub.publish(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, GslbError> {
        self.ensure_open()?;
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, GslbError> {
        self.hub.subscribe(prefix)
    }

    async fn close(&self) -> Result<(), GslbError> {
        self.hub.close();
        Ok(())
    }

    async fn ping(&self) -> bool {
        !self.hub.is_closed()
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
