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

//! Per-conversation sequence counters
//!
//! `MAXSEQ:<id>` holds the highest seq handed out, `MINSEQ:<id>` the lowest
//! seq still retained. Both live in the cache without expiry. Allocation is
//! not locked here: ingestion routes every conversation to a single lane, so
//! there is exactly one writer per counter.

use std::collections::HashMap;
use std::sync::Arc;

use msgline_core::keys::{
    has_read_seq_key, max_seq_key, min_seq_key, user_max_seq_key, user_min_seq_key,
};
use msgline_core::metrics::{self, SharedMetrics};
use msgline_core::{MsgData, MsglineError, Result};
use tracing::{debug, error, warn};

use crate::cache::CacheClient;
use crate::msg_cache::MsgCache;

/// Result of assigning seqs to a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Max seq before this batch.
    pub last_seq: i64,
    /// No counter existed for the conversation.
    pub is_new: bool,
    /// Highest seq each sender wrote in this batch.
    pub user_has_read: HashMap<String, i64>,
    /// Envelopes that could not be cached.
    pub cache_failures: usize,
}

pub struct SeqAllocator {
    cache: Arc<dyn CacheClient>,
    msg_cache: MsgCache,
    capacity: usize,
    metrics: SharedMetrics,
}

impl SeqAllocator {
    pub fn new(msg_cache: MsgCache, capacity: usize, metrics: SharedMetrics) -> Self {
        Self {
            cache: msg_cache.aside().client().clone(),
            msg_cache,
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn read_seq(&self, key: &str) -> Result<Option<i64>> {
        match self.cache.get(key).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| MsglineError::Cache(format!("non-numeric counter {key}={raw}"))),
            None => Ok(None),
        }
    }

    async fn read_seqs(&self, keys: Vec<String>, ids: &[String]) -> Result<HashMap<String, i64>> {
        let raws = self.cache.mget(&keys).await?;
        let mut out = HashMap::with_capacity(ids.len());
        for ((id, key), raw) in ids.iter().zip(&keys).zip(raws) {
            let seq = match raw {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| MsglineError::Cache(format!("non-numeric counter {key}={raw}")))?,
                None => 0,
            };
            out.insert(id.clone(), seq);
        }
        Ok(out)
    }

    /// Absent counters read as 0.
    pub async fn get_max_seq(&self, conversation_id: &str) -> Result<i64> {
        Ok(self
            .read_seq(&max_seq_key(conversation_id))
            .await?
            .unwrap_or(0))
    }

    pub async fn set_max_seq(&self, conversation_id: &str, seq: i64) -> Result<()> {
        self.cache
            .set(&max_seq_key(conversation_id), seq.to_string(), None)
            .await
    }

    pub async fn get_max_seqs(&self, conversation_ids: &[String]) -> Result<HashMap<String, i64>> {
        let keys = conversation_ids.iter().map(|id| max_seq_key(id)).collect();
        self.read_seqs(keys, conversation_ids).await
    }

    /// Absent counters read as 0.
    pub async fn get_min_seq(&self, conversation_id: &str) -> Result<i64> {
        Ok(self
            .read_seq(&min_seq_key(conversation_id))
            .await?
            .unwrap_or(0))
    }

    pub async fn set_min_seq(&self, conversation_id: &str, seq: i64) -> Result<()> {
        self.cache
            .set(&min_seq_key(conversation_id), seq.to_string(), None)
            .await
    }

    pub async fn get_min_seqs(&self, conversation_ids: &[String]) -> Result<HashMap<String, i64>> {
        let keys = conversation_ids.iter().map(|id| min_seq_key(id)).collect();
        self.read_seqs(keys, conversation_ids).await
    }

    pub async fn set_min_seqs(&self, seqs: &HashMap<String, i64>) -> Result<()> {
        let entries = seqs
            .iter()
            .map(|(id, seq)| (min_seq_key(id), seq.to_string(), None))
            .collect();
        self.cache.mset(entries).await
    }

    pub async fn get_has_read_seq(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        Ok(self
            .read_seq(&has_read_seq_key(conversation_id, user_id))
            .await?
            .unwrap_or(0))
    }

    pub async fn set_has_read_seq(&self, conversation_id: &str, user_id: &str, seq: i64) -> Result<()> {
        self.cache
            .set(&has_read_seq_key(conversation_id, user_id), seq.to_string(), None)
            .await
    }

    pub async fn set_has_read_seqs(
        &self,
        conversation_id: &str,
        user_seqs: &HashMap<String, i64>,
    ) -> Result<()> {
        if user_seqs.is_empty() {
            return Ok(());
        }
        let entries = user_seqs
            .iter()
            .map(|(user_id, seq)| (has_read_seq_key(conversation_id, user_id), seq.to_string(), None))
            .collect();
        self.cache.mset(entries).await
    }

    /// Where `user_id` starts reading the conversation; 0 when unset.
    pub async fn get_user_min_seq(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        Ok(self
            .read_seq(&user_min_seq_key(conversation_id, user_id))
            .await?
            .unwrap_or(0))
    }

    pub async fn set_user_min_seq(&self, conversation_id: &str, user_id: &str, seq: i64) -> Result<()> {
        self.cache
            .set(&user_min_seq_key(conversation_id, user_id), seq.to_string(), None)
            .await
    }

    /// Last seq `user_id` may read, e.g. after leaving a group; 0 when unset.
    pub async fn get_user_max_seq(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        Ok(self
            .read_seq(&user_max_seq_key(conversation_id, user_id))
            .await?
            .unwrap_or(0))
    }

    pub async fn set_user_max_seq(&self, conversation_id: &str, user_id: &str, seq: i64) -> Result<()> {
        self.cache
            .set(&user_max_seq_key(conversation_id, user_id), seq.to_string(), None)
            .await
    }

    /// Assigns `max+1 ..= max+len` to `msgs` in order, caches the envelopes
    /// and advances the counter.
    ///
    /// Envelope cache failures are counted, not fatal. A failure to store
    /// the new max seq is returned; the messages keep their assigned seqs.
    pub async fn batch_insert_chat2cache(
        &self,
        conversation_id: &str,
        msgs: &mut [MsgData],
    ) -> Result<InsertOutcome> {
        if msgs.is_empty() {
            return Err(MsglineError::BatchTooShort);
        }
        if msgs.len() > self.capacity {
            return Err(MsglineError::BatchTooLarge {
                len: msgs.len(),
                capacity: self.capacity,
            });
        }

        let current = self.read_seq(&max_seq_key(conversation_id)).await?;
        let is_new = current.is_none();
        let last_seq = current.unwrap_or(0);

        let mut user_has_read = HashMap::new();
        for (offset, msg) in msgs.iter_mut().enumerate() {
            msg.seq = last_seq + offset as i64 + 1;
            user_has_read.insert(msg.send_id.clone(), msg.seq);
        }
        let new_max = last_seq + msgs.len() as i64;

        let cache_failures = self.msg_cache.set_messages_to_cache(conversation_id, msgs).await;
        if cache_failures > 0 {
            warn!(conversation_id, failed = cache_failures, "some messages were not cached");
        }

        if let Err(e) = self.set_max_seq(conversation_id, new_max).await {
            error!(conversation_id, new_max, error = %e, "failed to store max seq");
            self.metrics.incr_counter(metrics::SEQ_SET_FAILED, 1);
            return Err(e);
        }

        if let Err(e) = self.set_has_read_seqs(conversation_id, &user_has_read).await {
            warn!(conversation_id, error = %e, "failed to store sender has-read seqs");
        }

        debug!(conversation_id, last_seq, new_max, is_new, "allocated seqs");
        Ok(InsertOutcome {
            last_seq,
            is_new,
            user_has_read,
            cache_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheAside, CacheAsideConfig, MemoryCache};
    use msgline_core::metrics::InMemoryMetrics;
    use proptest::prelude::*;
    use std::time::Duration;

    fn allocator(cache: Arc<MemoryCache>, capacity: usize) -> SeqAllocator {
        let msg_cache = MsgCache::new(
            CacheAside::new(cache, CacheAsideConfig::default()),
            Duration::from_secs(60),
            metrics::noop(),
        );
        SeqAllocator::new(msg_cache, capacity, metrics::noop())
    }

    #[tokio::test]
    async fn test_user_window_counters() {
        let cache = Arc::new(MemoryCache::new());
        let seqs = allocator(cache.clone(), 5000);
        assert_eq!(seqs.get_user_min_seq("sg_1", "u1").await.unwrap(), 0);
        assert_eq!(seqs.get_user_max_seq("sg_1", "u1").await.unwrap(), 0);

        seqs.set_user_min_seq("sg_1", "u1", 40).await.unwrap();
        seqs.set_user_max_seq("sg_1", "u1", 90).await.unwrap();
        assert_eq!(seqs.get_user_min_seq("sg_1", "u1").await.unwrap(), 40);
        assert_eq!(seqs.get_user_max_seq("sg_1", "u1").await.unwrap(), 90);
        assert_eq!(seqs.get_user_min_seq("sg_1", "u2").await.unwrap(), 0);
        assert!(cache.contains("CON_USER_MIN_SEQ:sg_1:u1"));
    }

    fn batch(sender: &str, n: usize) -> Vec<MsgData> {
        (0..n)
            .map(|i| MsgData {
                send_id: sender.to_string(),
                content: format!("hello {i}"),
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_batch_is_new() {
        let cache = Arc::new(MemoryCache::new());
        let seqs = allocator(cache.clone(), 5000);
        let mut msgs = batch("u1", 3);

        let outcome = seqs.batch_insert_chat2cache("sg_1", &mut msgs).await.unwrap();
        assert!(outcome.is_new);
        assert_eq!(outcome.last_seq, 0);
        assert_eq!(msgs.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(seqs.get_max_seq("sg_1").await.unwrap(), 3);
        assert_eq!(outcome.user_has_read.get("u1"), Some(&3));
        assert_eq!(seqs.get_has_read_seq("sg_1", "u1").await.unwrap(), 3);
        assert!(cache.contains("MSG:sg_1_2"));

        let mut more = batch("u2", 2);
        let outcome = seqs.batch_insert_chat2cache("sg_1", &mut more).await.unwrap();
        assert!(!outcome.is_new);
        assert_eq!(outcome.last_seq, 3);
        assert_eq!(more[1].seq, 5);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized_batches() {
        let cache = Arc::new(MemoryCache::new());
        let seqs = allocator(cache.clone(), 10);

        let err = seqs.batch_insert_chat2cache("c", &mut []).await.unwrap_err();
        assert!(matches!(err, MsglineError::BatchTooShort));

        let mut oversized = batch("u", 11);
        let err = seqs
            .batch_insert_chat2cache("c", &mut oversized)
            .await
            .unwrap_err();
        assert!(matches!(err, MsglineError::BatchTooLarge { len: 11, capacity: 10 }));

        assert_eq!(seqs.get_max_seq("c").await.unwrap(), 0);
        assert_eq!(cache.stats().sets, 0);
    }

    #[tokio::test]
    async fn test_max_seq_write_failure_is_reported() {
        let cache = Arc::new(MemoryCache::new());
        let recorder = Arc::new(InMemoryMetrics::new());
        let msg_cache = MsgCache::new(
            CacheAside::new(cache.clone(), CacheAsideConfig::default()),
            Duration::from_secs(60),
            recorder.clone(),
        );
        let seqs = SeqAllocator::new(msg_cache, 5000, recorder.clone());

        let mut msgs = batch("u", 2);
        assert!(seqs.batch_insert_chat2cache("c", &mut msgs).await.is_ok());

        // The envelope write fails, then the counter write fails.
        let mut msgs = batch("u", 1);
        cache.fail_next_sets(2);
        let err = seqs.batch_insert_chat2cache("c", &mut msgs).await;
        assert!(err.is_err());
        assert_eq!(recorder.counter(metrics::SEQ_SET_FAILED), 1);
        assert_eq!(recorder.counter(metrics::MSG_INSERT_CACHE_FAILED), 1);
    }

    #[tokio::test]
    async fn test_batch_min_max_reads() {
        let cache = Arc::new(MemoryCache::new());
        let seqs = allocator(cache, 5000);
        seqs.set_max_seq("a", 10).await.unwrap();
        seqs.set_min_seqs(&HashMap::from([("a".to_string(), 4), ("b".to_string(), 2)]))
            .await
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "z".to_string()];
        let max = seqs.get_max_seqs(&ids).await.unwrap();
        let min = seqs.get_min_seqs(&ids).await.unwrap();
        assert_eq!(max["a"], 10);
        assert_eq!(max["z"], 0);
        assert_eq!(min["a"], 4);
        assert_eq!(min["b"], 2);
        assert_eq!(seqs.get_min_seq("z").await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_seqs_are_gap_free(sizes in proptest::collection::vec(1usize..20, 1..10)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let seqs = allocator(Arc::new(MemoryCache::new()), 5000);
                let mut assigned = Vec::new();
                for size in &sizes {
                    let mut msgs = batch("u", *size);
                    seqs.batch_insert_chat2cache("c", &mut msgs).await.unwrap();
                    assigned.extend(msgs.iter().map(|m| m.seq));
                }
                let expected: Vec<i64> = (1..=sizes.iter().sum::<usize>() as i64).collect();
                assert_eq!(assigned, expected);
            });
        }
    }
}
