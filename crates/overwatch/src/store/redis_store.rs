//! Redis-backed store shared by an Overwatch cluster.

use anyhow::Context;
use async_trait::async_trait;
use gslb_common::GslbError;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;

use super::{KvPair, KvStore, WatchEvent, WatchHub};

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 100;

pub struct RedisStore {
    /// Redis connection manager (auto-reconnecting)
    conn: ConnectionManager,
    /// Watchers only observe writes made through this instance
    hub: WatchHub,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self {
            conn,
            hub: WatchHub::new(),
        })
    }
}

fn store_err(e: redis::RedisError) -> GslbError {
    GslbError::Store(e.to_string())
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN MATCH
fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GslbError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(store_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), GslbError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value.as_slice()).await.map_err(store_err)?;
        self.hub.publish(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GslbError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(store_err)?;
        if removed > 0 {
            self.hub.publish(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, GslbError> {
        let mut conn = self.conn.clone();
        let pattern = match_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();

        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<Vec<u8>> = conn.get(&key).await.map_err(store_err)?;
            // Deleted between SCAN and GET
            if let Some(value) = value {
                pairs.push(KvPair { key, value });
            }
        }
        Ok(pairs)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, GslbError> {
        self.hub.subscribe(prefix)
    }

    async fn close(&self) -> Result<(), GslbError> {
        self.hub.close();
        Ok(())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_pattern_escapes_glob_characters() {
        assert_eq!(match_pattern("backends/"), "backends/*");
        assert_eq!(match_pattern("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }
}
