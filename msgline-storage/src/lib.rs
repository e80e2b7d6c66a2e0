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

//! Msgline Storage
//!
//! Cache and durable tiers of the message pipeline:
//!
//! - `cache`: `CacheClient` capability, cache-aside fetch and batched
//!   soft-delete invalidation
//! - `doc_store`: `DocStore` capability for shard documents
//! - `seq`: per-conversation max/min seq counters and batch allocation
//! - `log_store`: capacity-sharded durable log
//! - `retention`: shard compaction and min seq advancement
//! - `read_path`: point and range reads with placeholder synthesis

pub mod cache;
pub mod doc_store;
pub mod locks;
pub mod log_store;
pub mod msg_cache;
pub mod read_path;
pub mod retention;
pub mod seq;

pub use cache::{CacheAside, CacheAsideConfig, CacheClient, MemoryCache, PendingInvalidation, RetryPolicy};
pub use doc_store::{DocStore, MemoryDocStore};
pub use locks::ConversationLocks;
pub use log_store::ShardedLogStore;
pub use msg_cache::MsgCache;
pub use read_path::ReadPath;
pub use retention::{CompactReport, RetentionCompactor};
pub use seq::{InsertOutcome, SeqAllocator};

use std::sync::Arc;
use std::time::Duration;

use msgline_core::SharedMetrics;

/// Everything the pipeline needs, wired over one cache and one doc store.
#[derive(Clone)]
pub struct Storage {
    pub msg_cache: MsgCache,
    pub seqs: Arc<SeqAllocator>,
    pub log: Arc<ShardedLogStore>,
    pub reads: Arc<ReadPath>,
    pub retention: Arc<RetentionCompactor>,
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub shard_capacity: usize,
    pub msg_cache_ttl: Duration,
    pub cache: CacheAsideConfig,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            shard_capacity: msgline_core::SHARD_CAPACITY,
            msg_cache_ttl: Duration::from_secs(24 * 60 * 60),
            cache: CacheAsideConfig::default(),
        }
    }
}

impl Storage {
    pub fn new(
        cache: Arc<dyn CacheClient>,
        docs: Arc<dyn DocStore>,
        options: StorageOptions,
        metrics: SharedMetrics,
    ) -> Self {
        let aside = CacheAside::new(cache, options.cache);
        let msg_cache = MsgCache::new(aside.clone(), options.msg_cache_ttl, metrics.clone());
        let seqs = Arc::new(SeqAllocator::new(
            msg_cache.clone(),
            options.shard_capacity,
            metrics.clone(),
        ));
        let log = Arc::new(ShardedLogStore::new(
            docs,
            aside,
            Arc::new(ConversationLocks::new()),
            options.shard_capacity,
            metrics.clone(),
        ));
        let reads = Arc::new(ReadPath::new(
            msg_cache.clone(),
            log.clone(),
            seqs.clone(),
            metrics.clone(),
        ));
        let retention = Arc::new(RetentionCompactor::new(
            log.clone(),
            seqs.clone(),
            msg_cache.clone(),
            metrics,
        ));
        Self {
            msg_cache,
            seqs,
            log,
            reads,
            retention,
        }
    }

    /// In-memory backends, for tests and single-process runs.
    pub fn in_memory(options: StorageOptions, metrics: SharedMetrics) -> Self {
        Self::new(
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryDocStore::new()),
            options,
            metrics,
        )
    }
}
