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

//! Cache-aside fetch and batched invalidation
//!
//! ## Fetch
//!
//! A hit is deserialized and returned. On a miss the caller takes the
//! backend's per-key lock so only one loader runs per key; everyone else
//! polls until the value shows up or the lock wait expires. Loaded values
//! are stored with a randomized TTL so entries written together do not all
//! expire together. A loader that finds nothing stores `NOT_FOUND_MARKER`,
//! which later reads surface as `MsglineError::NotFound` without touching the
//! store again.
//!
//! ## Invalidation
//!
//! Writers collect affected keys in a `PendingInvalidation` and call
//! `exec_del` once at the end of the logical operation. All keys are
//! soft-deleted in a single backend call, retried on a fixed schedule.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use msgline_core::{MsglineError, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{CacheClient, RetryPolicy};

/// Stored when the loader reports nothing for a key.
pub const NOT_FOUND_MARKER: &str = "";

const LOCK_PREFIX: &str = "LOCK:";

#[derive(Debug, Clone)]
pub struct CacheAsideConfig {
    /// TTL is scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub expiry_jitter: f64,
    pub lock_ttl: Duration,
    pub lock_poll_interval: Duration,
    /// How long a waiter polls before giving up with `LockTimeout`.
    pub lock_wait: Duration,
    pub invalidation_retry: RetryPolicy,
}

impl Default for CacheAsideConfig {
    fn default() -> Self {
        Self {
            expiry_jitter: 0.2,
            lock_ttl: Duration::from_secs(3),
            lock_poll_interval: Duration::from_millis(20),
            lock_wait: Duration::from_secs(3),
            invalidation_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct CacheAside {
    client: Arc<dyn CacheClient>,
    config: CacheAsideConfig,
}

impl CacheAside {
    pub fn new(client: Arc<dyn CacheClient>, config: CacheAsideConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Arc<dyn CacheClient> {
        &self.client
    }

    pub fn config(&self) -> &CacheAsideConfig {
        &self.config
    }

    /// Starts an empty invalidation set bound to this cache.
    pub fn invalidation(&self) -> PendingInvalidation {
        PendingInvalidation::new(self.client.clone(), self.config.invalidation_retry.clone())
    }

    pub fn jittered_ttl(&self, ttl: Duration) -> Duration {
        let jitter = self.config.expiry_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ttl;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        ttl.mul_f64(factor)
    }

    pub async fn fetch<T, F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(raw) = self.client.get(key).await? {
            return decode(key, &raw);
        }

        let lock_key = format!("{LOCK_PREFIX}{key}");
        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.lock_wait;

        while !self
            .client
            .try_lock(&lock_key, &owner, self.config.lock_ttl)
            .await?
        {
            tokio::time::sleep(self.config.lock_poll_interval).await;
            if let Some(raw) = self.client.get(key).await? {
                return decode(key, &raw);
            }
            if Instant::now() >= deadline {
                return Err(MsglineError::LockTimeout(key.to_string()));
            }
        }

        let loaded: Result<String> = async {
            // Another loader may have finished between our miss and the lock.
            if let Some(raw) = self.client.get(key).await? {
                return Ok(raw);
            }
            let raw = match loader().await? {
                Some(value) => serde_json::to_string(&value)?,
                None => NOT_FOUND_MARKER.to_string(),
            };
            self.client
                .set(key, raw.clone(), Some(self.jittered_ttl(ttl)))
                .await?;
            Ok(raw)
        }
        .await;

        if let Err(e) = self.client.unlock(&lock_key, &owner).await {
            warn!(key, error = %e, "failed to release cache lock");
        }

        decode(key, &loaded?)
    }

    /// Batch form of `fetch`.
    ///
    /// The loader receives indices into `keys` that missed and returns the
    /// values it found by index. Missing indices are cached as not-found.
    /// The result is aligned with `keys`; `None` means not found.
    pub async fn batch_fetch<T, F, Fut>(
        &self,
        keys: &[String],
        ttl: Duration,
        loader: F,
    ) -> Result<Vec<Option<T>>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<usize>) -> Fut,
        Fut: Future<Output = Result<HashMap<usize, T>>>,
    {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let raws = self.client.mget(keys).await?;
        let mut out: Vec<Option<T>> = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (index, raw) in raws.into_iter().enumerate() {
            match raw {
                Some(raw) if raw == NOT_FOUND_MARKER => out.push(None),
                Some(raw) => match serde_json::from_str(&raw) {
                    Ok(value) => out.push(Some(value)),
                    Err(e) => {
                        warn!(key = %keys[index], error = %e, "undecodable cache entry, reloading");
                        out.push(None);
                        missing.push(index);
                    }
                },
                None => {
                    out.push(None);
                    missing.push(index);
                }
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }
        debug!(total = keys.len(), missing = missing.len(), "batch fetch miss");

        let mut loaded = loader(missing.clone()).await?;
        let mut entries = Vec::with_capacity(missing.len());
        let mut unencodable = 0usize;
        for index in missing {
            let raw = match loaded.remove(&index) {
                Some(value) => {
                    let encoded = serde_json::to_string(&value);
                    out[index] = Some(value);
                    match encoded {
                        Ok(raw) => raw,
                        Err(e) => {
                            // Served but left uncached; the next read loads it again.
                            warn!(key = %keys[index], error = %e, "failed to encode loaded value");
                            unencodable += 1;
                            continue;
                        }
                    }
                }
                None => NOT_FOUND_MARKER.to_string(),
            };
            entries.push((keys[index].clone(), raw, Some(self.jittered_ttl(ttl))));
        }
        if unencodable > 0 {
            warn!(unencodable, "batch fetch left values uncached");
        }

        if let Err(e) = self.client.mset(entries).await {
            // Values are already in hand; a failed repopulate only costs a reload.
            warn!(error = %e, "failed to repopulate cache after batch fetch");
        }
        Ok(out)
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    if raw == NOT_FOUND_MARKER {
        return Err(MsglineError::NotFound(key.to_string()));
    }
    Ok(serde_json::from_str(raw)?)
}

/// Keys awaiting soft deletion.
pub struct PendingInvalidation {
    client: Arc<dyn CacheClient>,
    retry: RetryPolicy,
    keys: Vec<String>,
}

impl PendingInvalidation {
    pub fn new(client: Arc<dyn CacheClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            keys: Vec::new(),
        }
    }

    pub fn add_keys<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.keys.extend(keys);
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear_keys(&mut self) {
        self.keys.clear();
    }

    /// Soft-deletes every pending key in one call. The set is drained
    /// whether or not the call succeeds.
    pub async fn exec_del(&mut self) -> Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }

        let mut keys = std::mem::take(&mut self.keys);
        keys.sort();
        keys.dedup();

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.client.tag_as_deleted(&keys).await {
                Ok(()) => {
                    debug!(count = keys.len(), attempt, "cache keys invalidated");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "cache invalidation attempt failed");
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.interval).await;
                    }
                }
            }
        }

        error!(keys = ?keys, "cache invalidation exhausted retries, entries may be stale");
        Err(MsglineError::Invalidation {
            keys,
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }
}
