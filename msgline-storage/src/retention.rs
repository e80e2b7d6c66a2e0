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

//! Retention compaction
//!
//! Walks a conversation's shards oldest first. A full shard whose last
//! message is past retention is dropped whole; otherwise expired slots are
//! tombstoned in place until the first live message, whose seq becomes the
//! new minimum retained seq. Deletions are deferred to the end of the walk.

use std::sync::Arc;

use msgline_core::keys::msg_key;
use msgline_core::metrics::{self, SharedMetrics};
use msgline_core::{now_ms, MsgData, Result};
use tracing::{debug, info, warn};

use crate::log_store::ShardedLogStore;
use crate::msg_cache::MsgCache;
use crate::seq::SeqAllocator;

/// Cache and store max seqs further apart than this are reported.
pub const MAX_SEQ_DRIFT: i64 = 10;

#[derive(Debug, Default)]
struct CompactState {
    /// Highest seq known to be gone.
    min_seq: i64,
    pending_delete: Vec<String>,
    tombstoned: Vec<i64>,
}

/// Outcome of one compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactReport {
    pub min_seq: i64,
    pub docs_deleted: u64,
    pub msgs_tombstoned: usize,
}

pub struct RetentionCompactor {
    log: Arc<ShardedLogStore>,
    seqs: Arc<SeqAllocator>,
    msg_cache: MsgCache,
    metrics: SharedMetrics,
}

impl RetentionCompactor {
    pub fn new(
        log: Arc<ShardedLogStore>,
        seqs: Arc<SeqAllocator>,
        msg_cache: MsgCache,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            log,
            seqs,
            msg_cache,
            metrics,
        }
    }

    /// Drops messages older than `remain_secs`; `0` drops everything.
    /// Returns the new minimum retained seq.
    pub async fn compact(&self, conversation_id: &str, remain_secs: i64) -> Result<i64> {
        Ok(self
            .compact_at(conversation_id, remain_secs, now_ms())
            .await?
            .min_seq)
    }

    pub async fn compact_at(
        &self,
        conversation_id: &str,
        remain_secs: i64,
        now_ms: i64,
    ) -> Result<CompactReport> {
        let expired = |msg: &MsgData| remain_secs <= 0 || msg.send_time + remain_secs * 1000 < now_ms;
        let capacity = self.log.capacity();
        let store = self.log.store().clone();

        let _guard = self.log.locks().lock(conversation_id).await;

        let mut state = CompactState::default();
        let mut skip = 0;
        let walked_min = loop {
            let Some(doc) = store.find_doc_by_order(conversation_id, skip, true).await? else {
                break state.min_seq + 1;
            };

            if doc.is_full(capacity) && doc.last_msg().is_some_and(|m| expired(m)) {
                if let Some(last) = doc.last_msg() {
                    state.min_seq = last.seq;
                }
                state.pending_delete.push(doc.doc_id);
                skip += 1;
                continue;
            }

            let mut updates = Vec::new();
            let mut live = None;
            for (index, slot) in doc.msgs.iter().enumerate() {
                let Some(msg) = slot.msg.as_ref() else {
                    continue;
                };
                if msg.is_deleted() {
                    state.min_seq = msg.seq;
                } else if expired(msg) {
                    let mut cleared = slot.clone();
                    cleared.tombstone();
                    updates.push((index, cleared));
                    state.tombstoned.push(msg.seq);
                    state.min_seq = msg.seq;
                } else {
                    live = Some(msg.seq);
                    break;
                }
            }

            if !updates.is_empty() {
                store.update_slots(&doc.doc_id, updates).await?;
            }
            if let Some(seq) = live {
                break seq;
            }
            skip += 1;
        };

        let docs_deleted = self.log.delete_docs(&state.pending_delete).await?;

        // The walk restarts from the oldest remaining doc, so a conversation
        // whose early shards are already gone must not move backwards.
        let current_min = self.seqs.get_min_seq(conversation_id).await?;
        let min_seq = walked_min.max(current_min);
        if min_seq != current_min {
            self.seqs.set_min_seq(conversation_id, min_seq).await?;
        }

        if remain_secs <= 0 {
            let purged = self.msg_cache.purge_conversation(conversation_id).await?;
            debug!(conversation_id, purged, "purged cached envelopes");
        }

        self.metrics
            .incr_counter(metrics::RETENTION_DOCS_DELETED, docs_deleted);
        self.metrics
            .incr_counter(metrics::RETENTION_MSGS_TOMBSTONED, state.tombstoned.len() as u64);
        info!(
            conversation_id,
            min_seq,
            docs_deleted,
            tombstoned = state.tombstoned.len(),
            "compacted conversation"
        );

        let mut pending = self.msg_cache.aside().invalidation();
        pending.add_keys(
            state
                .tombstoned
                .iter()
                .map(|&seq| msg_key(conversation_id, seq)),
        );
        if let Err(e) = pending.exec_del().await {
            self.metrics
                .incr_counter(metrics::CACHE_INVALIDATION_FAILED, 1);
            return Err(e);
        }

        Ok(CompactReport {
            min_seq,
            docs_deleted,
            msgs_tombstoned: state.tombstoned.len(),
        })
    }

    /// Moves `user_id`'s read floor past messages whose self-destruct window
    /// of `destruct_secs` has elapsed since `last_destruct_ms`. Returns the
    /// seqs destructed for the user; the messages stay for everyone else.
    pub async fn user_msgs_destruct(
        &self,
        conversation_id: &str,
        user_id: &str,
        destruct_secs: i64,
        last_destruct_ms: i64,
    ) -> Result<Vec<i64>> {
        self.user_msgs_destruct_at(conversation_id, user_id, destruct_secs, last_destruct_ms, now_ms())
            .await
    }

    pub async fn user_msgs_destruct_at(
        &self,
        conversation_id: &str,
        user_id: &str,
        destruct_secs: i64,
        last_destruct_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<i64>> {
        let seqs = self
            .log
            .user_destruct_seqs(conversation_id, user_id, destruct_secs, last_destruct_ms, now_ms)
            .await?;
        let Some(&last) = seqs.last() else {
            return Ok(seqs);
        };

        let floor = last + 1;
        let current = self.seqs.get_user_min_seq(conversation_id, user_id).await?;
        if current < floor {
            self.seqs
                .set_user_min_seq(conversation_id, user_id, floor)
                .await?;
        }
        info!(conversation_id, user_id, destructed = seqs.len(), floor, "user messages destructed");
        Ok(seqs)
    }

    /// Compares the allocated max seq with the newest stored seq and
    /// returns the difference.
    pub async fn check_max_seq_with_store(&self, conversation_id: &str) -> Result<i64> {
        let cached = self.seqs.get_max_seq(conversation_id).await?;
        let stored = self
            .log
            .get_newest_msg(conversation_id)
            .await?
            .map_or(0, |m| m.seq);
        let drift = cached - stored;
        self.metrics.set_gauge(metrics::SEQ_DRIFT, drift);
        if drift.abs() > MAX_SEQ_DRIFT {
            warn!(conversation_id, cached, stored, drift, "max seq drifted from store");
        }
        Ok(drift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheAside, CacheAsideConfig, CacheClient, MemoryCache};
    use crate::doc_store::MemoryDocStore;
    use crate::locks::ConversationLocks;
    use msgline_core::metrics::InMemoryMetrics;
    use std::time::Duration;

    const DAY_MS: i64 = 86_400_000;

    struct Fixture {
        cache: Arc<MemoryCache>,
        log: Arc<ShardedLogStore>,
        seqs: Arc<SeqAllocator>,
        compactor: RetentionCompactor,
        recorder: Arc<InMemoryMetrics>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let recorder = Arc::new(InMemoryMetrics::new());
        let aside = CacheAside::new(cache.clone(), CacheAsideConfig::default());
        let msg_cache = MsgCache::new(aside.clone(), Duration::from_secs(60), recorder.clone());
        let log = Arc::new(ShardedLogStore::new(
            Arc::new(MemoryDocStore::new()),
            aside,
            Arc::new(ConversationLocks::new()),
            capacity,
            recorder.clone(),
        ));
        let seqs = Arc::new(SeqAllocator::new(msg_cache.clone(), capacity, recorder.clone()));
        let compactor =
            RetentionCompactor::new(log.clone(), seqs.clone(), msg_cache, recorder.clone());
        Fixture {
            cache,
            log,
            seqs,
            compactor,
            recorder,
        }
    }

    /// Writes seqs `first..first+n` sent at `send_time`.
    async fn write(f: &Fixture, first: i64, n: usize, send_time: i64) {
        let msgs: Vec<MsgData> = (0..n as i64)
            .map(|i| MsgData {
                seq: first + i,
                content: format!("m{}", first + i),
                send_time,
                ..Default::default()
            })
            .collect();
        f.log
            .batch_insert_chat2db("c", &msgs, first - 1)
            .await
            .unwrap();
        f.seqs.set_max_seq("c", first - 1 + n as i64).await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_full_expired_shard_and_tombstones_partial() {
        let f = fixture(10);
        let now = 100 * DAY_MS;
        write(&f, 1, 10, now - 10 * DAY_MS).await;
        write(&f, 11, 3, now - 10 * DAY_MS).await;
        write(&f, 14, 2, now).await;
        f.cache.set("MSG:c_12", "{}".into(), None).await.unwrap();

        let report = f
            .compactor
            .compact_at("c", 7 * 86_400, now)
            .await
            .unwrap();

        assert_eq!(report.min_seq, 14);
        assert_eq!(report.docs_deleted, 1);
        assert_eq!(report.msgs_tombstoned, 3);
        assert_eq!(f.seqs.get_min_seq("c").await.unwrap(), 14);
        assert!(f.log.find_one_by_doc_id("c:0").await.unwrap().is_none());

        let doc = f.log.find_one_by_doc_id("c:1").await.unwrap().unwrap();
        assert_eq!(doc.msgs.len(), 5);
        assert!(doc.msgs[1].msg.as_ref().unwrap().is_deleted());
        assert_eq!(doc.msgs[3].msg.as_ref().unwrap().content, "m14");
        assert!(!f.cache.contains("MSG:c_12"));
        assert_eq!(f.recorder.counter(metrics::RETENTION_DOCS_DELETED), 1);
    }

    #[tokio::test]
    async fn test_nothing_expired_keeps_everything() {
        let f = fixture(10);
        let now = 100 * DAY_MS;
        write(&f, 1, 4, now).await;

        let report = f.compactor.compact_at("c", 86_400, now).await.unwrap();
        assert_eq!(report.min_seq, 1);
        assert_eq!(report.docs_deleted, 0);
        assert_eq!(report.msgs_tombstoned, 0);
    }

    #[tokio::test]
    async fn test_all_expired_ends_past_last_seq() {
        let f = fixture(10);
        write(&f, 1, 10, 1).await;
        write(&f, 11, 4, 1).await;

        let min = f.compactor.compact("c", 86_400).await.unwrap();
        assert_eq!(min, 15);
        assert!(f.log.find_one_by_doc_id("c:0").await.unwrap().is_none());
        let doc = f.log.find_one_by_doc_id("c:1").await.unwrap().unwrap();
        assert!(doc.msgs.iter().all(|s| s.msg.as_ref().unwrap().is_deleted()));
    }

    #[tokio::test]
    async fn test_zero_retention_purges_cache() {
        let f = fixture(10);
        let now = 100 * DAY_MS;
        write(&f, 1, 3, now).await;
        f.cache.set("MSG:c_1", "{}".into(), None).await.unwrap();
        f.cache.set("MSG:c_3", "{}".into(), None).await.unwrap();

        let report = f.compactor.compact_at("c", 0, now).await.unwrap();
        assert_eq!(report.min_seq, 4);
        assert!(!f.cache.contains("MSG:c_1"));
        assert!(!f.cache.contains("MSG:c_3"));
    }

    #[tokio::test]
    async fn test_repeated_compaction_never_lowers_min_seq() {
        let f = fixture(10);
        let now = 100 * DAY_MS;
        write(&f, 1, 10, now - 10 * DAY_MS).await;
        write(&f, 11, 10, now - 10 * DAY_MS).await;
        write(&f, 21, 2, now).await;

        let first = f.compactor.compact_at("c", 86_400, now).await.unwrap();
        assert_eq!(first.min_seq, 21);
        assert_eq!(first.docs_deleted, 2);

        let second = f.compactor.compact_at("c", 86_400, now).await.unwrap();
        assert_eq!(second.min_seq, 21);
        assert_eq!(second.docs_deleted, 0);
    }

    #[tokio::test]
    async fn test_drift_check() {
        let f = fixture(10);
        write(&f, 1, 5, 1).await;
        assert_eq!(f.compactor.check_max_seq_with_store("c").await.unwrap(), 0);

        f.seqs.set_max_seq("c", 40).await.unwrap();
        assert_eq!(f.compactor.check_max_seq_with_store("c").await.unwrap(), 35);
        assert_eq!(f.recorder.gauge(metrics::SEQ_DRIFT), Some(35));
    }

    #[tokio::test]
    async fn test_user_destruct_moves_only_that_users_floor() {
        let f = fixture(10);
        let now = 100 * DAY_MS;
        write(&f, 1, 4, now - 2 * DAY_MS).await;
        write(&f, 5, 2, now).await;

        let seqs = f
            .compactor
            .user_msgs_destruct_at("c", "u1", 86_400, 0, now)
            .await
            .unwrap();

        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(f.seqs.get_user_min_seq("c", "u1").await.unwrap(), 5);
        assert_eq!(f.seqs.get_user_min_seq("c", "u2").await.unwrap(), 0);
        assert_eq!(f.seqs.get_min_seq("c").await.unwrap(), 0);

        // A later run with nothing new leaves the floor where it is.
        let again = f
            .compactor
            .user_msgs_destruct_at("c", "u1", 86_400, now - DAY_MS, now)
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(f.seqs.get_user_min_seq("c", "u1").await.unwrap(), 5);
    }
}
