mod memory;

pub use memory::MemoryLockService;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::TransportRetry;
use crate::model::ActorId;

/// Transport-level failure talking to the lock service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lock service unavailable: {0}")]
pub struct LockServiceError(pub String);

/// Client contract of the shared key space that backs unit locks. Every
/// primitive is atomic on the service side.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Set `key` to `value` only if absent. True when the set happened.
    async fn cond_set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockServiceError>;

    /// Delete `key` only if its value equals `expected`.
    async fn cond_delete(&self, key: &str, expected: &str) -> Result<bool, LockServiceError>;

    /// Reset the TTL of `key` only if its value equals `expected`.
    async fn cond_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, LockServiceError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LockServiceError>;
}

/// Proof of lock ownership: the exact value stored under the unit key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    value: String,
}

impl LockToken {
    fn mint(actor_id: &str) -> Self {
        Self {
            value: format!("{actor_id}:{}", Ulid::new()),
        }
    }

    /// Parse a stored `{actor}:{nonce}` value. The nonce never contains ':',
    /// so actor ids may.
    pub fn parse(value: &str) -> Option<Self> {
        let (actor, nonce) = value.rsplit_once(':')?;
        if actor.is_empty() || nonce.is_empty() {
            return None;
        }
        Some(Self {
            value: value.to_string(),
        })
    }

    pub fn actor_id(&self) -> &str {
        self.value.rsplit_once(':').map(|(a, _)| a).unwrap_or(&self.value)
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Someone else holds the unit. `owner` is None if the lock vanished
    /// between the failed set and the owner lookup.
    #[error("unit {unit_id} occupied by {}", .owner.as_deref().unwrap_or("unknown"))]
    Denied { unit_id: String, owner: Option<ActorId> },
    #[error(transparent)]
    Infrastructure(#[from] LockServiceError),
}

/// Exclusive, TTL-bounded unit locks on top of a [`LockService`].
///
/// Denial is immediate: `acquire` never waits for a holder to go away. Only
/// transport failures are retried, with the [`TransportRetry`] budget.
pub struct DistributedLockManager {
    service: Arc<dyn LockService>,
    transport: TransportRetry,
}

impl DistributedLockManager {
    pub fn new(service: Arc<dyn LockService>, transport: TransportRetry) -> Self {
        Self { service, transport }
    }

    pub async fn acquire(&self, unit_id: &str, actor_id: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let token = LockToken::mint(actor_id);
        let acquired = self
            .with_retry("cond_set", || self.service.cond_set(unit_id, token.value(), ttl))
            .await?;
        if acquired {
            debug!(unit_id, actor_id, "lock acquired");
            return Ok(token);
        }

        let owner = self.holder(unit_id).await?.map(|t| t.actor_id().to_string());
        Err(LockError::Denied {
            unit_id: unit_id.to_string(),
            owner,
        })
    }

    /// Remove the lock only if it still carries `token`. False when the lock
    /// expired or now belongs to someone else.
    pub async fn release(&self, unit_id: &str, token: &LockToken) -> Result<bool, LockError> {
        let released = self
            .with_retry("cond_delete", || self.service.cond_delete(unit_id, token.value()))
            .await?;
        debug!(unit_id, released, "lock release");
        Ok(released)
    }

    pub async fn extend(&self, unit_id: &str, token: &LockToken, ttl: Duration) -> Result<bool, LockError> {
        self.with_retry("cond_expire", || self.service.cond_expire(unit_id, token.value(), ttl))
            .await
            .map_err(Into::into)
    }

    /// Current holder of the unit lock, if any.
    pub async fn holder(&self, unit_id: &str) -> Result<Option<LockToken>, LockError> {
        let value = self.with_retry("get", || self.service.get(unit_id)).await?;
        Ok(value.as_deref().and_then(LockToken::parse))
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, LockServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LockServiceError>>,
    {
        let attempts = self.transport.attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    debug!(op, attempt, "lock service error, retrying: {e}");
                    tokio::time::sleep(self.transport.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(op, attempts, "lock service retries exhausted: {e}");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn manager() -> DistributedLockManager {
        DistributedLockManager::new(Arc::new(MemoryLockService::new()), TransportRetry::default())
    }

    /// Fails the first `failures` calls of every primitive, then delegates.
    struct FlakyLockService {
        inner: MemoryLockService,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyLockService {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryLockService::new(),
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> Result<(), LockServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(LockServiceError("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LockService for FlakyLockService {
        async fn cond_set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockServiceError> {
            self.trip()?;
            self.inner.cond_set(key, value, ttl).await
        }
        async fn cond_delete(&self, key: &str, expected: &str) -> Result<bool, LockServiceError> {
            self.trip()?;
            self.inner.cond_delete(key, expected).await
        }
        async fn cond_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, LockServiceError> {
            self.trip()?;
            self.inner.cond_expire(key, expected, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, LockServiceError> {
            self.trip()?;
            self.inner.get(key).await
        }
    }

    #[test]
    fn token_parse_handles_colons_in_actor() {
        let t = LockToken::parse("team:alice:01HX0000000000000000000000").unwrap();
        assert_eq!(t.actor_id(), "team:alice");
        assert!(LockToken::parse("no-separator").is_none());
        assert!(LockToken::parse(":nonce").is_none());
        assert!(LockToken::parse("actor:").is_none());
    }

    #[tokio::test]
    async fn acquire_then_denied_with_owner() {
        let mgr = manager();
        let token = mgr.acquire("S1", "w1", TTL).await.unwrap();
        assert_eq!(token.actor_id(), "w1");

        let err = mgr.acquire("S1", "w2", TTL).await.unwrap_err();
        assert_eq!(
            err,
            LockError::Denied {
                unit_id: "S1".into(),
                owner: Some("w1".into())
            }
        );
        assert_eq!(err.to_string(), "unit S1 occupied by w1");
    }

    #[tokio::test]
    async fn tokens_are_unique_per_acquire() {
        let mgr = manager();
        let a = mgr.acquire("S1", "w1", TTL).await.unwrap();
        assert!(mgr.release("S1", &a).await.unwrap());
        let b = mgr.acquire("S1", "w1", TTL).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn release_is_true_once() {
        let mgr = manager();
        let token = mgr.acquire("S1", "w1", TTL).await.unwrap();
        assert!(mgr.release("S1", &token).await.unwrap());
        assert!(!mgr.release("S1", &token).await.unwrap());
    }

    #[tokio::test]
    async fn stale_release_does_not_touch_new_owner() {
        let mgr = manager();
        let old = mgr.acquire("S1", "w1", TTL).await.unwrap();
        assert!(mgr.release("S1", &old).await.unwrap());
        let new = mgr.acquire("S1", "w2", TTL).await.unwrap();

        assert!(!mgr.release("S1", &old).await.unwrap());
        let holder = mgr.holder("S1").await.unwrap().unwrap();
        assert_eq!(holder, new);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_reacquired() {
        let mgr = manager();
        let old = mgr.acquire("S1", "w1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let new = mgr.acquire("S1", "w2", TTL).await.unwrap();
        assert!(!mgr.release("S1", &old).await.unwrap());
        assert!(!mgr.extend("S1", &old, TTL).await.unwrap());
        assert_eq!(mgr.holder("S1").await.unwrap(), Some(new));
    }

    #[tokio::test(start_paused = true)]
    async fn extend_pushes_expiry_out() {
        let mgr = manager();
        let token = mgr.acquire("S1", "w1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(mgr.extend("S1", &token, Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(mgr.holder("S1").await.unwrap(), Some(token));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_transport_errors_are_retried() {
        let mgr = DistributedLockManager::new(Arc::new(FlakyLockService::new(2)), TransportRetry::default());
        let token = mgr.acquire("S1", "w1", TTL).await.unwrap();
        assert_eq!(token.actor_id(), "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_retries_surface_infrastructure_error() {
        let mgr = DistributedLockManager::new(Arc::new(FlakyLockService::new(u32::MAX)), TransportRetry::default());
        let err = mgr.acquire("S1", "w1", TTL).await.unwrap_err();
        assert!(matches!(err, LockError::Infrastructure(_)));
    }
}
