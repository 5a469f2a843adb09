//! Best-effort, TTL-bounded mutual exclusion per cache key.
//!
//! [`DedupLock`] only reduces duplicate provider work; it is advisory. The
//! backing [`LockStore`] decides how far the exclusion reaches (one process
//! for [`MemoryLockStore`], every process sharing a directory for
//! [`FileLockStore`]). Expiry is the only liveness guarantee against a
//! crashed holder.
//!
//! Every acquisition stores a fresh token and release deletes the entry only
//! while it still carries that token, so a holder whose TTL lapsed can never
//! delete a successor's lock.

mod file;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genmedia_types::CacheKey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use file::FileLockStore;
pub use memory::MemoryLockStore;

/// Failures of the shared lock store itself (not contention).
#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("lock store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

/// Shared key-value store backing the dedup lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `token` under `key` for `ttl` unless an unexpired entry exists.
    /// Returns whether the entry was written.
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError>;

    /// Delete the entry for `key` only if it still carries `token`.
    async fn delete_if_matches(&self, key: &str, token: &str) -> Result<bool, LockStoreError>;

    /// Delete the entry for `key` whoever holds it.
    async fn delete(&self, key: &str) -> Result<(), LockStoreError>;
}

/// Proof of a successful acquisition, consumed by [`DedupLock::release`].
#[derive(Debug)]
#[must_use = "a lease that is never released holds the key until its TTL lapses"]
pub struct LockLease {
    key: CacheKey,
    token: String,
}

impl LockLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Result of [`DedupLock::acquire`].
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(LockLease),
    /// Another holder kept the key through every retry.
    Contended,
    /// The store itself failed; contention is unknown.
    StoreUnavailable(LockStoreError),
    Cancelled,
}

#[derive(Clone)]
pub struct DedupLock {
    store: Arc<dyn LockStore>,
    retry_interval: Duration,
}

impl DedupLock {
    pub fn new(store: Arc<dyn LockStore>, retry_interval: Duration) -> Self {
        Self {
            store,
            retry_interval,
        }
    }

    /// One attempt plus up to `max_retries` retries, sleeping the retry
    /// interval before each retry.
    pub async fn acquire(
        &self,
        key: &CacheKey,
        max_retries: u32,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> AcquireOutcome {
        let token = uuid::Uuid::new_v4().to_string();

        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return AcquireOutcome::Cancelled,
                    _ = tokio::time::sleep(self.retry_interval) => {}
                }
            }

            match self.store.set_if_absent(key.as_str(), &token, ttl).await {
                Ok(true) => {
                    info!(key = %key.short(), attempt, ttl_secs = ttl.as_secs(), "dedup lock acquired");
                    return AcquireOutcome::Acquired(LockLease {
                        key: key.clone(),
                        token,
                    });
                }
                Ok(false) => {
                    debug!(key = %key.short(), attempt, "dedup lock held elsewhere");
                }
                Err(e) => {
                    warn!(key = %key.short(), attempt, error = %e, "dedup lock store failed");
                    return AcquireOutcome::StoreUnavailable(e);
                }
            }
        }

        debug!(key = %key.short(), max_retries, "dedup lock still contended after retries");
        AcquireOutcome::Contended
    }

    /// Release `lease`. Returns `false` when the lock had already lapsed and
    /// was left alone (possibly held by a successor).
    pub async fn release(&self, lease: LockLease) -> bool {
        match self
            .store
            .delete_if_matches(lease.key.as_str(), &lease.token)
            .await
        {
            Ok(true) => {
                debug!(key = %lease.key.short(), "dedup lock released");
                true
            }
            Ok(false) => {
                warn!(
                    key = %lease.key.short(),
                    "dedup lock expired before release; leaving current holder alone"
                );
                false
            }
            Err(e) => {
                warn!(key = %lease.key.short(), error = %e, "dedup lock release failed");
                false
            }
        }
    }

    /// Drop whatever lock exists for `key`, regardless of holder.
    pub async fn force_release(&self, key: &CacheKey) -> Result<(), LockStoreError> {
        self.store.delete(key.as_str()).await?;
        info!(key = %key.short(), "dedup lock force-released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn key() -> CacheKey {
        CacheKey::try_from("ab".repeat(32)).unwrap()
    }

    fn lock() -> DedupLock {
        DedupLock::new(Arc::new(MemoryLockStore::new()), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn second_caller_is_contended_after_retries() {
        let lock = lock();
        let cancel = CancellationToken::new();

        let first = lock.acquire(&key(), 3, Duration::from_secs(30), &cancel).await;
        assert!(matches!(first, AcquireOutcome::Acquired(_)));

        let started = Instant::now();
        let second = lock.acquire(&key(), 3, Duration::from_secs(30), &cancel).await;
        assert!(matches!(second, AcquireOutcome::Contended));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_caller_succeeds_after_release() {
        let lock = lock();
        let cancel = CancellationToken::new();

        let AcquireOutcome::Acquired(lease) =
            lock.acquire(&key(), 0, Duration::from_secs(30), &cancel).await
        else {
            panic!("first acquire must succeed");
        };

        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(&key(), 3, Duration::from_secs(30), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(lock.release(lease).await);

        assert!(matches!(waiter.await.unwrap(), AcquireOutcome::Acquired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let lock = lock();
        let cancel = CancellationToken::new();

        let first = lock.acquire(&key(), 0, Duration::from_millis(1500), &cancel).await;
        assert!(matches!(first, AcquireOutcome::Acquired(_)));

        let started = Instant::now();
        let second = lock.acquire(&key(), 3, Duration::from_secs(30), &cancel).await;
        assert!(matches!(second, AcquireOutcome::Acquired(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_does_not_delete_successor() {
        let lock = lock();
        let cancel = CancellationToken::new();

        let AcquireOutcome::Acquired(stale) =
            lock.acquire(&key(), 0, Duration::from_secs(1), &cancel).await
        else {
            panic!("first acquire must succeed");
        };
        tokio::time::advance(Duration::from_secs(2)).await;

        let successor = lock.acquire(&key(), 0, Duration::from_secs(30), &cancel).await;
        assert!(matches!(successor, AcquireOutcome::Acquired(_)));

        assert!(!lock.release(stale).await);
        let third = lock.acquire(&key(), 0, Duration::from_secs(30), &cancel).await;
        assert!(matches!(third, AcquireOutcome::Contended));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry_sleep() {
        let lock = lock();
        let cancel = CancellationToken::new();
        let _held = lock.acquire(&key(), 0, Duration::from_secs(30), &cancel).await;

        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(&key(), 10, Duration::from_secs(30), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();

        let started = Instant::now();
        assert!(matches!(waiter.await.unwrap(), AcquireOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn force_release_clears_any_holder() {
        let lock = lock();
        let cancel = CancellationToken::new();
        let _held = lock.acquire(&key(), 0, Duration::from_secs(30), &cancel).await;

        lock.force_release(&key()).await.unwrap();
        let next = lock.acquire(&key(), 0, Duration::from_secs(30), &cancel).await;
        assert!(matches!(next, AcquireOutcome::Acquired(_)));
    }

    struct BrokenStore;

    #[async_trait]
    impl LockStore for BrokenStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockStoreError> {
            Err(LockStoreError::Unavailable("connection refused".into()))
        }
        async fn delete_if_matches(&self, _: &str, _: &str) -> Result<bool, LockStoreError> {
            Err(LockStoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), LockStoreError> {
            Err(LockStoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_reported_without_retrying() {
        let lock = DedupLock::new(Arc::new(BrokenStore), Duration::from_secs(1));
        let started = Instant::now();
        let outcome = lock
            .acquire(&key(), 3, Duration::from_secs(30), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, AcquireOutcome::StoreUnavailable(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
