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

//! Message reads: cache first, then the sharded log.
//!
//! Seqs that cannot be served (below the retained floor, tombstoned, or
//! missing from both tiers) come back as placeholders carrying only the seq,
//! so clients can tell a gap from a message they have not asked for.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use msgline_core::doc::{shard_index, shard_seq_range};
use msgline_core::keys::{msg_key, user_del_list_key};
use msgline_core::metrics::{self, SharedMetrics};
use msgline_core::{MsgData, PulledMsgs, Result};
use tracing::debug;

use crate::log_store::ShardedLogStore;
use crate::msg_cache::MsgCache;
use crate::seq::SeqAllocator;

pub struct ReadPath {
    msg_cache: MsgCache,
    log: Arc<ShardedLogStore>,
    seqs: Arc<SeqAllocator>,
    metrics: SharedMetrics,
}

impl ReadPath {
    pub fn new(
        msg_cache: MsgCache,
        log: Arc<ShardedLogStore>,
        seqs: Arc<SeqAllocator>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            msg_cache,
            log,
            seqs,
            metrics,
        }
    }

    /// Resolves `seqs` through the cache, loading misses from the log and
    /// repopulating the cache. Absent seqs are missing from the map.
    async fn resolve(&self, conversation_id: &str, seqs: &[i64]) -> Result<HashMap<i64, MsgData>> {
        let keys: Vec<String> = seqs
            .iter()
            .map(|&seq| msg_key(conversation_id, seq))
            .collect();

        let values = self
            .msg_cache
            .aside()
            .batch_fetch(&keys, self.msg_cache.ttl(), |missing| async move {
                let wanted: Vec<i64> = missing.iter().map(|&index| seqs[index]).collect();
                debug!(conversation_id, misses = wanted.len(), "loading messages from store");
                let mut found = self.log.find_msgs_by_seqs(conversation_id, &wanted).await?;
                Ok(missing
                    .into_iter()
                    .filter_map(|index| found.remove(&seqs[index]).map(|msg| (index, msg)))
                    .collect())
            })
            .await?;

        Ok(values
            .into_iter()
            .flatten()
            .map(|msg: MsgData| (msg.seq, msg))
            .collect())
    }

    fn placeholder(&self, seq: i64) -> MsgData {
        self.metrics.incr_counter(metrics::READ_PLACEHOLDERS, 1);
        MsgData::placeholder(seq)
    }

    /// The seqs `user_id` can see cut out of the conversation's range:
    /// a per-user floor raises the minimum, a per-user cap lowers the maximum.
    async fn user_window(&self, conversation_id: &str, user_id: &str) -> Result<(i64, i64)> {
        let (min_seq, max_seq) = self.conversation_window(conversation_id).await?;
        let user_min = self.seqs.get_user_min_seq(conversation_id, user_id).await?;
        let user_max = self.seqs.get_user_max_seq(conversation_id, user_id).await?;
        let max_seq = if user_max > 0 { max_seq.min(user_max) } else { max_seq };
        Ok((min_seq.max(user_min), max_seq))
    }

    async fn conversation_window(&self, conversation_id: &str) -> Result<(i64, i64)> {
        let min_seq = self.seqs.get_min_seq(conversation_id).await?;
        let max_seq = self.seqs.get_max_seq(conversation_id).await?;
        Ok((min_seq, max_seq))
    }

    /// Seqs `user_id` deleted for themselves, through the cache.
    async fn hidden_seqs(&self, conversation_id: &str, user_id: &str) -> Result<HashSet<i64>> {
        let seqs: Vec<i64> = self
            .msg_cache
            .aside()
            .fetch(
                &user_del_list_key(conversation_id, user_id),
                self.msg_cache.ttl(),
                || async { Ok(Some(self.log.user_deleted_seqs(conversation_id, user_id).await?)) },
            )
            .await?;
        Ok(seqs.into_iter().collect())
    }

    /// Point lookup. Every requested seq within `1..=max_seq` yields either
    /// its message or a placeholder, in ascending order.
    pub async fn get_msg_by_seqs(&self, conversation_id: &str, seqs: &[i64]) -> Result<PulledMsgs> {
        let window = self.conversation_window(conversation_id).await?;
        self.pull_seqs(conversation_id, seqs, window, &HashSet::new())
            .await
    }

    /// Point lookup as `user_id` sees the conversation. Seqs outside the
    /// user's window or deleted by the user come back as placeholders.
    pub async fn get_msg_by_seqs_for_user(
        &self,
        user_id: &str,
        conversation_id: &str,
        seqs: &[i64],
    ) -> Result<PulledMsgs> {
        let window = self.user_window(conversation_id, user_id).await?;
        let hidden = self.hidden_seqs(conversation_id, user_id).await?;
        self.pull_seqs(conversation_id, seqs, window, &hidden).await
    }

    async fn pull_seqs(
        &self,
        conversation_id: &str,
        seqs: &[i64],
        (min_seq, max_seq): (i64, i64),
        hidden: &HashSet<i64>,
    ) -> Result<PulledMsgs> {
        let mut wanted: Vec<i64> = seqs
            .iter()
            .copied()
            .filter(|&seq| seq > 0 && seq <= max_seq)
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let retained: Vec<i64> = wanted
            .iter()
            .copied()
            .filter(|&seq| seq >= min_seq && !hidden.contains(&seq))
            .collect();
        let mut found = self.resolve(conversation_id, &retained).await?;

        let msgs = wanted
            .into_iter()
            .map(|seq| match found.remove(&seq) {
                Some(msg) if seq >= min_seq && !msg.is_deleted() => msg,
                _ => self.placeholder(seq),
            })
            .collect();

        Ok(PulledMsgs {
            min_seq,
            max_seq,
            msgs,
        })
    }

    /// Up to `count` of the newest messages in `begin..=end`.
    ///
    /// The range is clamped to the retained window. Tombstoned messages are
    /// dropped and the window grows downward, one shard per pass and never
    /// below `begin`, until `count` is reached. Seqs missing from both tiers
    /// still count and are returned as placeholders.
    pub async fn get_msg_by_seqs_range(
        &self,
        conversation_id: &str,
        begin: i64,
        end: i64,
        count: usize,
    ) -> Result<PulledMsgs> {
        let window = self.conversation_window(conversation_id).await?;
        self.pull_range(conversation_id, begin, end, count, window, &HashSet::new())
            .await
    }

    /// Range read as `user_id` sees the conversation: clamped to the user's
    /// window, with the user's own deletions dropped like tombstones.
    pub async fn get_msg_by_seqs_range_for_user(
        &self,
        user_id: &str,
        conversation_id: &str,
        begin: i64,
        end: i64,
        count: usize,
    ) -> Result<PulledMsgs> {
        let window = self.user_window(conversation_id, user_id).await?;
        let hidden = self.hidden_seqs(conversation_id, user_id).await?;
        self.pull_range(conversation_id, begin, end, count, window, &hidden)
            .await
    }

    async fn pull_range(
        &self,
        conversation_id: &str,
        begin: i64,
        end: i64,
        count: usize,
        (min_seq, max_seq): (i64, i64),
        hidden: &HashSet<i64>,
    ) -> Result<PulledMsgs> {
        let begin = begin.max(min_seq).max(1);
        let end = end.min(max_seq);
        let mut msgs = Vec::new();
        if count == 0 || begin > end {
            return Ok(PulledMsgs {
                min_seq,
                max_seq,
                msgs,
            });
        }

        let capacity = self.log.capacity();
        let mut high = end;
        let mut first_pass = true;
        while msgs.len() < count && high >= begin {
            let need = i64::try_from(count - msgs.len())
                .unwrap_or(i64::MAX)
                .min(high - begin + 1);
            let mut low = high - need + 1;
            if !first_pass {
                let (shard_start, _) = shard_seq_range(shard_index(high, capacity), capacity);
                low = low.max(shard_start);
            }

            let window: Vec<i64> = (low..=high).filter(|seq| !hidden.contains(seq)).collect();
            let mut dropped = (high - low + 1) as usize - window.len();
            let mut found = self.resolve(conversation_id, &window).await?;
            for seq in window.into_iter().rev() {
                match found.remove(&seq) {
                    Some(msg) if msg.is_deleted() => dropped += 1,
                    Some(msg) => msgs.push(msg),
                    None => msgs.push(self.placeholder(seq)),
                }
            }
            debug!(conversation_id, low, high, dropped, "range pass");

            high = low - 1;
            first_pass = false;
        }

        msgs.truncate(count);
        msgs.sort_by_key(|msg| msg.seq);
        Ok(PulledMsgs {
            min_seq,
            max_seq,
            msgs,
        })
    }
}
