//! Store adapter
//!
//! Narrow async KV contract the broker needs from the external store:
//! get/set-with-ttl/del/incr/expire/ping. Backed by redis in production,
//! by an in-memory fake in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::BrokerError;

/// Six-operation async KV contract used by the invite service and rate limiters.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError>;
    async fn del(&self, key: &str) -> Result<(), BrokerError>;
    async fn incr(&self, key: &str) -> Result<i64, BrokerError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Redis-backed store. One `ConnectionManager` reused across calls; redis
/// handles reconnection internally, matching the local-recovery policy.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::StoreError(format!("invalid store url: {e}")))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| BrokerError::StoreError(format!("store connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| BrokerError::StoreError(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(|e| BrokerError::StoreError(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| BrokerError::StoreError(e.to_string())),
        }
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| BrokerError::StoreError(e.to_string()))
    }

    async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1)
            .await
            .map_err(|e| BrokerError::StoreError(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(|e| BrokerError::StoreError(e.to_string()))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::StoreError(e.to_string()))
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory store fake for unit and integration tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let map = self.inner.lock().await;
        Ok(map
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut map = self.inner.lock().await;
        map.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut map = self.inner.lock().await;
        let current: i64 = map
            .get(key)
            .filter(|e| Self::is_live(e))
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
