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

//! Cached message envelopes (`MSG:<conversation>_<seq>`).

use std::sync::Arc;
use std::time::Duration;

use msgline_core::keys::{msg_key, msg_key_prefix, msg_key_seq};
use msgline_core::metrics::{self, SharedMetrics};
use msgline_core::{MsgData, Result};
use tracing::warn;

use crate::cache::CacheAside;

#[derive(Clone)]
pub struct MsgCache {
    aside: CacheAside,
    ttl: Duration,
    metrics: SharedMetrics,
}

impl MsgCache {
    pub fn new(aside: CacheAside, ttl: Duration, metrics: SharedMetrics) -> Self {
        Self { aside, ttl, metrics }
    }

    pub fn aside(&self) -> &CacheAside {
        &self.aside
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Writes one envelope per message; returns how many writes failed.
    pub async fn set_messages_to_cache(&self, conversation_id: &str, msgs: &[MsgData]) -> usize {
        let mut failed = 0;
        for msg in msgs {
            let key = msg_key(conversation_id, msg.seq);
            let outcome: Result<()> = match serde_json::to_string(msg) {
                Ok(raw) => {
                    self.aside
                        .client()
                        .set(&key, raw, Some(self.aside.jittered_ttl(self.ttl)))
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                warn!(conversation_id, seq = msg.seq, error = %e, "failed to cache message");
                failed += 1;
            }
        }

        let succeeded = msgs.len() - failed;
        if succeeded > 0 {
            self.metrics
                .incr_counter(metrics::MSG_INSERT_CACHE_SUCCESS, succeeded as u64);
        }
        if failed > 0 {
            self.metrics
                .incr_counter(metrics::MSG_INSERT_CACHE_FAILED, failed as u64);
        }
        failed
    }

    /// Soft-deletes the envelopes of `seqs` in one batch.
    pub async fn delete_messages(&self, conversation_id: &str, seqs: &[i64]) -> Result<()> {
        let mut pending = self.aside.invalidation();
        pending.add_keys(seqs.iter().map(|&seq| msg_key(conversation_id, seq)));
        pending.exec_del().await
    }

    /// Drops every cached envelope of a conversation, leaving conversations
    /// whose id merely extends this one untouched.
    pub async fn purge_conversation(&self, conversation_id: &str) -> Result<u64> {
        let client = self.aside.client();
        let keys: Vec<String> = client
            .scan_prefix(&msg_key_prefix(conversation_id))
            .await?
            .into_iter()
            .filter(|key| msg_key_seq(conversation_id, key).is_some())
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        client.delete(&keys).await
    }
}
