use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LockStore, LockStoreError};

/// Expiry for a TTL too large to add to the clock.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(100 * 365 * 24 * 60 * 60)
}

struct Entry {
    token: String,
    expires_at: Instant,
}

/// In-process [`LockStore`]. Exclusion reaches every task of this process.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the guard cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        entries.retain(|_, e| e.expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                token: token.to_owned(),
                expires_at: now.checked_add(ttl).unwrap_or_else(far_future),
            },
        );
        Ok(true)
    }

    async fn delete_if_matches(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(e) if e.token == token && e.expires_at > now => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_evicted_on_the_next_acquire() {
        let store = MemoryLockStore::new();
        for i in 0..16 {
            let key = format!("k{i}");
            assert!(store.set_if_absent(&key, "t", Duration::from_secs(1)).await.unwrap());
        }
        assert_eq!(store.len(), 16);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("fresh", "t", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn live_holder_survives_eviction() {
        let store = MemoryLockStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
        assert!(store.delete_if_matches("k", "a").await.unwrap());
    }

    #[tokio::test]
    async fn unbounded_ttl_is_held() {
        let store = MemoryLockStore::new();
        assert!(store.set_if_absent("k", "a", Duration::MAX).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::MAX).await.unwrap());
    }
}
