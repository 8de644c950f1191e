//! Rate limiting
//!
//! Two limiters with different backing stores per §4.2: an in-memory
//! fixed-window per-IP connection limiter (cheap, no I/O on the hot path),
//! and a store-backed invite-attempt counter (needs to survive across
//! broker restarts and multiple broker instances).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::BrokerError;
use crate::store::Store;

struct Window {
    started_at: Instant,
    count: usize,
}

/// Fixed-window per-IP connection attempt limiter.
///
/// A periodic sweep (driven by `main`) removes windows older than the
/// configured window so the map does not grow unbounded under churn.
#[derive(Clone)]
pub struct ConnectionLimiter {
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
    window: Duration,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
            max,
        }
    }

    /// Atomically check-and-reserve one attempt for `ip`. Returns the
    /// seconds the caller should wait before retrying if rejected.
    pub async fn try_acquire(&self, ip: IpAddr) -> Result<(), BrokerError> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert_with(|| Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= self.max {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs()
                .max(1);
            warn!(%ip, "connection rate limit exceeded");
            return Err(BrokerError::RateLimitedConnection {
                retry_after_secs: retry_after,
            });
        }

        entry.count += 1;
        Ok(())
    }

    /// Remove windows whose period has fully elapsed. Called from a
    /// periodic background task.
    pub async fn sweep(&self) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let window = self.window;
        windows.retain(|_, w| now.duration_since(w.started_at) < window * 2);
    }
}

/// Store-backed invite-attempt limiter. Shared across broker instances
/// since brute-force protection on a single-use invite must hold even if
/// the broker restarts mid-window. Keyed by IP per §3 (`invite:attempts:<ip>`)
/// — a brute-forcer trying many different tokens from the same IP must
/// still trip the limiter, and a different IP must not be penalized by it
/// (scenario 2's per-IP isolation).
pub struct InviteLimiter {
    store: Arc<dyn Store>,
    window: Duration,
    max: usize,
}

impl InviteLimiter {
    pub fn new(store: Arc<dyn Store>, window: Duration, max: usize) -> Self {
        Self {
            store,
            window,
            max,
        }
    }

    fn key(ip: IpAddr) -> String {
        format!("invite:attempts:{ip}")
    }

    /// Read-only pre-check: has `ip` already exhausted its attempt budget
    /// for the current window? Does not itself count as an attempt.
    pub async fn peek(&self, ip: IpAddr) -> Result<(), BrokerError> {
        let current: i64 = self
            .store
            .get(&Self::key(ip))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if current >= self.max as i64 {
            warn!(%ip, current, "invite attempts already rate limited");
            return Err(BrokerError::RateLimitedInvite {
                retry_after_secs: self.window.as_secs(),
            });
        }
        Ok(())
    }

    /// Record one failed redemption attempt for `ip`, arming the TTL on
    /// first use of the window. Successful redemptions must never call
    /// this (§4.2 — a successful redemption does not clear or grow the
    /// counter).
    pub async fn record_failure(&self, ip: IpAddr) -> Result<(), BrokerError> {
        let key = Self::key(ip);
        let count = self.store.incr(&key).await?;
        if count == 1 {
            self.store.expire(&key, self.window).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn connection_limiter_allows_up_to_max() {
        let limiter = ConnectionLimiter::new(Duration::from_secs(60), 3);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.try_acquire(ip).await.is_ok());
        assert!(limiter.try_acquire(ip).await.is_ok());
        assert!(limiter.try_acquire(ip).await.is_ok());
        assert!(limiter.try_acquire(ip).await.is_err());
    }

    #[tokio::test]
    async fn connection_limiter_resets_after_window() {
        let limiter = ConnectionLimiter::new(Duration::from_millis(20), 1);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.try_acquire(ip).await.is_ok());
        assert!(limiter.try_acquire(ip).await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.try_acquire(ip).await.is_ok());
    }

    #[tokio::test]
    async fn connection_limiter_tracks_ips_independently() {
        let limiter = ConnectionLimiter::new(Duration::from_secs(60), 1);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.try_acquire(a).await.is_ok());
        assert!(limiter.try_acquire(b).await.is_ok());
        assert!(limiter.try_acquire(a).await.is_err());
    }

    #[tokio::test]
    async fn invite_limiter_blocks_after_max_failures() {
        let store = Arc::new(MemoryStore::new());
        let limiter = InviteLimiter::new(store, Duration::from_secs(60), 2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.peek(ip).await.is_ok());
        limiter.record_failure(ip).await.unwrap();
        assert!(limiter.peek(ip).await.is_ok());
        limiter.record_failure(ip).await.unwrap();
        assert!(limiter.peek(ip).await.is_err());
    }

    #[tokio::test]
    async fn invite_limiter_tracks_ips_independently() {
        let store = Arc::new(MemoryStore::new());
        let limiter = InviteLimiter::new(store, Duration::from_secs(60), 1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        limiter.record_failure(a).await.unwrap();
        assert!(limiter.peek(a).await.is_err());
        assert!(limiter.peek(b).await.is_ok());
    }
}
