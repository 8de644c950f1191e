//! Invite service
//!
//! Single-use (or bounded-use) invite tokens persisted in the store.
//! Validation order is fixed by §4.3: rate-limit, well-formed, exists,
//! not revoked, not expired, usage < max.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::rate_limit::InviteLimiter;
use crate::store::Store;

/// Why a validate() call did not return `valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteRejectReason {
    Missing,
    Invalid,
    NotFound,
    Expired,
    Used,
    Revoked,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub token: String,
    pub label: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub usage_count: u32,
    pub max_usages: u32,
    pub revoked: bool,
    pub creator_id: String,
}

impl InviteRecord {
    fn is_expired(&self, now: u64) -> bool {
        self.usage_count >= self.max_usages || now > self.expires_at
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn invite_key(token: &str) -> String {
    format!("invite:{token}")
}

/// Generates, persists, and validates invite tokens against the store.
pub struct InviteService {
    store: Arc<dyn Store>,
    limiter: Arc<InviteLimiter>,
}

impl InviteService {
    pub fn new(store: Arc<dyn Store>, limiter: Arc<InviteLimiter>) -> Self {
        Self { store, limiter }
    }

    /// Generate a URL-safe token with >=128 bits of entropy.
    fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// `create(label, expiresAt, maxUsages=1) -> token`.
    pub async fn create(
        &self,
        label: Option<String>,
        expires_at: u64,
        max_usages: u32,
        creator_id: &str,
    ) -> Result<String, BrokerError> {
        let token = Self::generate_token();
        let record = InviteRecord {
            token: token.clone(),
            label,
            created_at: now_secs(),
            expires_at,
            usage_count: 0,
            max_usages: max_usages.max(1),
            revoked: false,
            creator_id: creator_id.to_string(),
        };
        let serialized = serde_json::to_string(&record)
            .map_err(|e| BrokerError::Internal(format!("invite serialize failed: {e}")))?;
        self.store.set(&invite_key(&token), &serialized, None).await?;
        info!(token_prefix = &token[..8.min(token.len())], "invite created");
        Ok(token)
    }

    /// Set revoked=true; the record is preserved for audit.
    pub async fn revoke(&self, token: &str) -> Result<(), BrokerError> {
        let key = invite_key(token);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or(BrokerError::InviteNotFound)?;
        let mut record: InviteRecord = serde_json::from_str(&raw)
            .map_err(|e| BrokerError::Internal(format!("invite deserialize failed: {e}")))?;
        record.revoked = true;
        let serialized = serde_json::to_string(&record)
            .map_err(|e| BrokerError::Internal(format!("invite serialize failed: {e}")))?;
        self.store.set(&key, &serialized, None).await?;
        info!(token_prefix = &token[..8.min(token.len())], "invite revoked");
        Ok(())
    }

    fn well_formed(token: &str) -> bool {
        !token.is_empty() && token.len() <= 512 && token.chars().all(|c| c.is_ascii_graphic())
    }

    /// `validate(token, ip) -> {valid, reason?}`.
    ///
    /// Validation order per §4.3: rate-limit pre-check (by IP) → well-formed
    /// → exists → not revoked → not expired → usage < max. Every non-valid
    /// outcome other than the rate-limit rejection itself is echoed back to
    /// the invite limiter as a failed attempt against `ip` (not the token —
    /// brute-forcing many different tokens from one IP must still trip the
    /// limiter, per scenario 2). On valid, usage is incremented via a
    /// best-effort read-modify-write; the store lacks CAS so concurrent
    /// redemptions of the same invite may overshoot `max_usages` by a small
    /// margin under extreme races.
    pub async fn validate(
        &self,
        token: Option<&str>,
        ip: IpAddr,
    ) -> Result<(), InviteRejectReason> {
        if self.limiter.peek(ip).await.is_err() {
            warn!(%ip, "invite validate rejected: rate limited");
            return Err(InviteRejectReason::RateLimited);
        }

        let Some(token) = token else {
            self.record_failure(ip, InviteRejectReason::Missing).await;
            return Err(InviteRejectReason::Missing);
        };

        if !Self::well_formed(token) {
            self.record_failure(ip, InviteRejectReason::Invalid).await;
            return Err(InviteRejectReason::Invalid);
        }

        let raw = match self.store.get(&invite_key(token)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.record_failure(ip, InviteRejectReason::NotFound).await;
                return Err(InviteRejectReason::NotFound);
            }
            Err(_) => {
                self.record_failure(ip, InviteRejectReason::NotFound).await;
                return Err(InviteRejectReason::NotFound);
            }
        };

        let mut record: InviteRecord = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(_) => {
                self.record_failure(ip, InviteRejectReason::NotFound).await;
                return Err(InviteRejectReason::NotFound);
            }
        };

        if record.revoked {
            self.record_failure(ip, InviteRejectReason::Revoked).await;
            return Err(InviteRejectReason::Revoked);
        }

        let now = now_secs();
        if now > record.expires_at {
            self.record_failure(ip, InviteRejectReason::Expired).await;
            return Err(InviteRejectReason::Expired);
        }

        if record.usage_count >= record.max_usages {
            self.record_failure(ip, InviteRejectReason::Used).await;
            return Err(InviteRejectReason::Used);
        }

        record.usage_count += 1;
        let is_expired_now = record.is_expired(now);
        let serialized = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(_) => return Err(InviteRejectReason::NotFound),
        };
        if self
            .store
            .set(&invite_key(token), &serialized, None)
            .await
            .is_err()
        {
            return Err(InviteRejectReason::NotFound);
        }

        info!(
            token_prefix = &token[..8.min(token.len())],
            usage = record.usage_count,
            exhausted = is_expired_now,
            "invite redeemed"
        );
        Ok(())
    }

    /// Every non-valid outcome (except a rate-limit rejection, which the
    /// limiter has already accounted for) counts against the per-IP invite
    /// rate limiter (§4.2). Successful redemptions never reach here.
    async fn record_failure(&self, ip: IpAddr, reason: InviteRejectReason) {
        warn!(%ip, ?reason, "invite validate rejected");
        if let Err(e) = self.limiter.record_failure(ip).await {
            warn!(%ip, error = %e, "failed to record invite rate-limit attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limiter() -> Arc<InviteLimiter> {
        Arc::new(InviteLimiter::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            3,
        ))
    }

    fn service() -> InviteService {
        InviteService::new(Arc::new(MemoryStore::new()), limiter())
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn create_then_validate_succeeds_once() {
        let svc = service();
        let token = svc
            .create(Some("test".into()), now_secs() + 3600, 1, "admin")
            .await
            .unwrap();
        assert!(svc.validate(Some(&token), ip()).await.is_ok());
    }

    #[tokio::test]
    async fn max_usages_plus_one_returns_used() {
        let svc = service();
        let token = svc
            .create(None, now_secs() + 3600, 2, "admin")
            .await
            .unwrap();
        assert!(svc.validate(Some(&token), ip()).await.is_ok());
        assert!(svc.validate(Some(&token), ip()).await.is_ok());
        assert_eq!(
            svc.validate(Some(&token), ip()).await.unwrap_err(),
            InviteRejectReason::Used
        );
    }

    #[tokio::test]
    async fn unknown_token_returns_not_found() {
        let svc = service();
        assert_eq!(
            svc.validate(Some("nonexistent"), ip()).await.unwrap_err(),
            InviteRejectReason::NotFound
        );
    }

    #[tokio::test]
    async fn revoked_invite_rejected() {
        let svc = service();
        let token = svc
            .create(None, now_secs() + 3600, 1, "admin")
            .await
            .unwrap();
        svc.revoke(&token).await.unwrap();
        assert_eq!(
            svc.validate(Some(&token), ip()).await.unwrap_err(),
            InviteRejectReason::Revoked
        );
    }

    #[tokio::test]
    async fn expired_invite_rejected() {
        let svc = service();
        let token = svc.create(None, now_secs() - 10, 1, "admin").await.unwrap();
        assert_eq!(
            svc.validate(Some(&token), ip()).await.unwrap_err(),
            InviteRejectReason::Expired
        );
    }

    #[tokio::test]
    async fn missing_token_returns_missing() {
        let svc = service();
        assert_eq!(
            svc.validate(None, ip()).await.unwrap_err(),
            InviteRejectReason::Missing
        );
    }

    #[tokio::test]
    async fn repeated_failures_trip_rate_limit() {
        let svc = service();
        assert_eq!(
            svc.validate(Some("bad1"), ip()).await.unwrap_err(),
            InviteRejectReason::NotFound
        );
        assert_eq!(
            svc.validate(Some("bad2"), ip()).await.unwrap_err(),
            InviteRejectReason::NotFound
        );
        assert_eq!(
            svc.validate(Some("bad3"), ip()).await.unwrap_err(),
            InviteRejectReason::NotFound
        );
        assert_eq!(
            svc.validate(Some("bad4"), ip()).await.unwrap_err(),
            InviteRejectReason::RateLimited
        );
    }

    #[tokio::test]
    async fn rate_limit_is_per_ip() {
        let svc = service();
        let other_ip: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..3 {
            let _ = svc.validate(Some("bad"), ip()).await;
        }
        assert_eq!(
            svc.validate(Some("bad"), ip()).await.unwrap_err(),
            InviteRejectReason::RateLimited
        );
        assert_eq!(
            svc.validate(Some("bad"), other_ip).await.unwrap_err(),
            InviteRejectReason::NotFound
        );
    }
}
