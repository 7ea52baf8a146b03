use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{LockService, LockServiceError};

#[derive(Debug, Clone)]
struct LockEntry {
    value: String,
    expires_at: Instant,
}

impl LockEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process lock service. Each primitive runs under the DashMap shard lock
/// for its key, so it is atomic with respect to every other primitive on
/// that key. Expired entries behave as absent; `purge_expired` reclaims them.
///
/// Uses the tokio clock so tests can drive expiry with a paused runtime.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    entries: DashMap<String, LockEntry>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }

    /// Number of live locks.
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn cond_set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockServiceError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(LockEntry::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn cond_delete(&self, key: &str, expected: &str) -> Result<bool, LockServiceError> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.value == expected && entry.is_live(now));
        Ok(removed.is_some())
    }

    async fn cond_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, LockServiceError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.value == expected && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockServiceError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }
}
