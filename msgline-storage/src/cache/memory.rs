// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-process `CacheClient` backed by `DashMap`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use msgline_core::{MsglineError, Result};

use super::CacheClient;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    deleted: bool,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        !self.deleted && self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Operation counters, mainly for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub gets: u64,
    pub hits: u64,
    pub sets: u64,
    pub tag_calls: u64,
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    locks: DashMap<String, LockEntry>,
    gets: AtomicU64,
    hits: AtomicU64,
    sets: AtomicU64,
    tag_calls: AtomicU64,
    failing_tag_calls: AtomicU32,
    failing_sets: AtomicU32,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            tag_calls: self.tag_calls.load(Ordering::Relaxed),
        }
    }

    /// Live entry check that does not count as a read.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.is_live(Instant::now()))
    }

    pub fn is_tagged_deleted(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.deleted)
    }

    /// Makes the next `n` `tag_as_deleted` calls fail.
    pub fn fail_next_tag_calls(&self, n: u32) {
        self.failing_tag_calls.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_sets(&self, n: u32) {
        self.failing_sets.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self, key: &str, now: Instant) -> Option<String> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let value = self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone());
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn write(&self, key: String, value: String, ttl: Option<Duration>) -> Result<()> {
        if Self::take_failure(&self.failing_sets) {
            return Err(MsglineError::Cache(format!("injected write failure for {key}")));
        }
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                deleted: false,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key, Instant::now()))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let now = Instant::now();
        Ok(keys.iter().map(|key| self.read(key, now)).collect())
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.write(key.to_string(), value, ttl)
    }

    async fn mset(&self, entries: Vec<(String, String, Option<Duration>)>) -> Result<()> {
        for (key, value, ttl) in entries {
            self.write(key, value, ttl)?;
        }
        Ok(())
    }

    async fn tag_as_deleted(&self, keys: &[String]) -> Result<()> {
        self.tag_calls.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.failing_tag_calls) {
            return Err(MsglineError::Cache("injected tag failure".into()));
        }
        for key in keys {
            match self.entries.get_mut(key) {
                Some(mut entry) => entry.deleted = true,
                None => {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: String::new(),
                            expires_at: None,
                            deleted: true,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| {
                entry.key().starts_with(prefix)
                    && entry.value().expires_at.map_or(true, |at| at > now)
            })
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count() as u64)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut acquired = false;
        self.locks
            .entry(key.to_string())
            .and_modify(|lock| {
                if lock.expires_at <= now || lock.owner == owner {
                    lock.owner = owner.to_string();
                    lock.expires_at = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockEntry {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                }
            });
        Ok(acquired)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        self.locks.remove_if(key, |_, lock| lock.owner == owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let cache = MemoryCache::new();
        cache.set("a", "1".into(), None).await.unwrap();
        cache
            .set("b", "2".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.get("b").await.unwrap().as_deref(), Some("2"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_tag_as_deleted_hides_value() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), None).await.unwrap();
        cache.tag_as_deleted(&["k".to_string()]).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_tagged_deleted("k"));

        cache.set("k", "v2".into(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(5);
        assert!(cache.try_lock("l", "a", ttl).await.unwrap());
        assert!(!cache.try_lock("l", "b", ttl).await.unwrap());

        cache.unlock("l", "b").await.unwrap();
        assert!(!cache.try_lock("l", "b", ttl).await.unwrap());

        cache.unlock("l", "a").await.unwrap();
        assert!(cache.try_lock("l", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let cache = MemoryCache::new();
        assert!(cache
            .try_lock("l", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache
            .try_lock("l", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_scan_prefix_and_delete() {
        let cache = MemoryCache::new();
        cache.set("MSG:c_1", "x".into(), None).await.unwrap();
        cache.set("MSG:c_2", "x".into(), None).await.unwrap();
        cache.set("MSG:d_1", "x".into(), None).await.unwrap();
        cache.tag_as_deleted(&["MSG:c_9".to_string()]).await.unwrap();

        let mut keys = cache.scan_prefix("MSG:c_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["MSG:c_1", "MSG:c_2", "MSG:c_9"]);

        assert_eq!(cache.delete(&keys).await.unwrap(), 3);
        assert!(!cache.is_tagged_deleted("MSG:c_9"));
        assert_eq!(cache.delete(&keys).await.unwrap(), 0);
        assert!(cache.contains("MSG:d_1"));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cache = MemoryCache::new();
        cache.fail_next_tag_calls(1);
        assert!(cache.tag_as_deleted(&["k".to_string()]).await.is_err());
        assert!(cache.tag_as_deleted(&["k".to_string()]).await.is_ok());
        assert_eq!(cache.stats().tag_calls, 2);
    }
}
