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

//! Distributed cache capability
//!
//! `CacheClient` is the narrow surface the pipeline needs from a key/value
//! cache: point and batch reads, TTL writes, soft deletion and a per-key
//! lock. `CacheAside` layers fetch-or-populate and batched invalidation on
//! top of it.

pub mod aside;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use msgline_core::Result;

pub use aside::{CacheAside, CacheAsideConfig, PendingInvalidation, NOT_FOUND_MARKER};
pub use memory::MemoryCache;

#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Returns `None` for absent, expired and soft-deleted keys.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// One round trip; the result is aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// `ttl = None` stores without expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn mset(&self, entries: Vec<(String, String, Option<Duration>)>) -> Result<()>;

    /// Marks keys deleted so the next fetch reloads them.
    async fn tag_as_deleted(&self, keys: &[String]) -> Result<()>;

    /// Unexpired keys starting with `prefix`, soft-deleted ones included.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes `keys` outright, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Acquires `key` for `owner` unless another owner holds an unexpired lock.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases `key` if `owner` still holds it.
    async fn unlock(&self, key: &str, owner: &str) -> Result<()>;
}

/// Fixed-interval retry schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_millis(100))
    }
}
