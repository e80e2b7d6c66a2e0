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

//! Per-lane processing of inbound message records.
//!
//! A lane receives every record for a conversation in arrival order, so seq
//! allocation here needs no further coordination.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use msgline_core::message::{content_type, notification_conversation_id, MarkAsReadTips};
use msgline_core::metrics::{self, SharedMetrics};
use msgline_core::wire::{self, ModifyMsgBatch, PushMsgEvent, StoreMsgBatch};
use msgline_core::{MsgData, MsgOptions, MsglineError};
use msgline_storage::SeqAllocator;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::batcher::BatchHandler;
use crate::broker::BrokerClient;
use crate::config::TopicsConfig;

/// Messages of one lane slice, split by where they go.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Partitioned {
    /// Durable history; gets seqs.
    pub persist: Vec<MsgData>,
    /// Delivered without a seq.
    pub non_persist: Vec<MsgData>,
    /// Durable notifications, sequenced in the notification stream.
    pub notify_persist: Vec<MsgData>,
    pub notify_non_persist: Vec<MsgData>,
    /// Reactions and edits. Also present in one of the sets above.
    pub modify: Vec<MsgData>,
}

pub fn partition(msgs: Vec<MsgData>) -> Partitioned {
    let mut parts = Partitioned::default();
    for mut msg in msgs {
        if msg.is_modify() {
            parts.modify.push(msg.clone());
        }
        if !msg.options.is_notification {
            if msg.options.is_history {
                parts.persist.push(msg);
            } else {
                parts.non_persist.push(msg);
            }
            continue;
        }

        if msg.options.is_send_msg {
            // The chat copy carries the push and unread flags; the
            // notification itself no longer does.
            let mut chat = msg.clone();
            chat.options = MsgOptions {
                is_offline_push: msg.options.is_offline_push,
                is_unread_count: msg.options.is_unread_count,
                ..MsgOptions::default()
            };
            parts.persist.push(chat);
            msg.options.is_offline_push = false;
            msg.options.is_unread_count = false;
        }
        if msg.options.is_history {
            parts.notify_persist.push(msg);
        } else {
            parts.notify_non_persist.push(msg);
        }
    }
    parts
}

/// A sender's own copy is not pushed back to them unless sender sync is on.
fn push_suppressed(key: &str, msg: &MsgData) -> bool {
    !msg.options.is_sender_sync && key == msg.send_id
}

pub struct TransferHandler {
    seqs: Arc<SeqAllocator>,
    broker: Arc<dyn BrokerClient>,
    topics: TopicsConfig,
    metrics: SharedMetrics,
}

impl TransferHandler {
    pub fn new(
        seqs: Arc<SeqAllocator>,
        broker: Arc<dyn BrokerClient>,
        topics: TopicsConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            seqs,
            broker,
            topics,
            metrics,
        }
    }

    fn decode(&self, key: &str, records: Vec<Vec<u8>>) -> Vec<MsgData> {
        let mut msgs = Vec::with_capacity(records.len());
        for record in records {
            match wire::decode::<MsgData>(&record) {
                Ok(msg) => msgs.push(msg),
                Err(e) => {
                    warn!(key, error = %e, "skipping undecodable record");
                    self.metrics.incr_counter(metrics::INGEST_DECODE_FAILED, 1);
                }
            }
        }
        msgs
    }

    /// Runs one slice through the pipeline. Each emission fails on its own.
    pub async fn process(&self, key: &str, msgs: Vec<MsgData>) {
        if msgs.is_empty() {
            return;
        }
        self.metrics
            .incr_counter(metrics::INGEST_RECORDS, msgs.len() as u64);
        self.record_read_receipts(&msgs).await;

        let Partitioned {
            persist,
            non_persist,
            notify_persist,
            notify_non_persist,
            modify,
        } = partition(msgs);
        debug!(
            key,
            persist = persist.len(),
            non_persist = non_persist.len(),
            notify_persist = notify_persist.len(),
            notify_non_persist = notify_non_persist.len(),
            modify = modify.len(),
            "partitioned slice"
        );

        if !modify.is_empty() {
            let batch = ModifyMsgBatch {
                conversation_id: key.to_string(),
                msgs: modify,
            };
            self.publish(&self.topics.to_modify, key, &batch, metrics::MODIFY_PUBLISH_FAILED)
                .await;
        }

        if !non_persist.is_empty() {
            self.push_all(key, key, non_persist).await;
        }
        if !persist.is_empty() {
            self.persist_and_push(key, key, persist).await;
        }

        if notify_persist.is_empty() && notify_non_persist.is_empty() {
            return;
        }
        let notification_id = notification_conversation_id(key);
        if !notify_non_persist.is_empty() {
            self.push_all(key, &notification_id, notify_non_persist).await;
        }
        if !notify_persist.is_empty() {
            self.persist_and_push(key, &notification_id, notify_persist)
                .await;
        }
    }

    /// Allocates seqs in `conversation_id`, then emits the store batch and
    /// the pushes keyed by the lane `key`.
    async fn persist_and_push(&self, key: &str, conversation_id: &str, mut persist: Vec<MsgData>) {
        let outcome = match self
            .seqs
            .batch_insert_chat2cache(conversation_id, &mut persist)
            .await
        {
            Ok(outcome) => outcome,
            Err(e @ (MsglineError::BatchTooLarge { .. } | MsglineError::BatchTooShort)) => {
                warn!(conversation_id, len = persist.len(), error = %e, "dropping rejected batch");
                self.metrics.incr_counter(metrics::INGEST_BATCH_REJECTED, 1);
                return;
            }
            Err(e) => {
                error!(conversation_id, len = persist.len(), error = %e, "seq allocation failed");
                return;
            }
        };

        if outcome.is_new {
            info!(conversation_id, "new conversation");
            self.metrics.incr_counter(metrics::NEW_CONVERSATIONS, 1);
        }

        let batch = StoreMsgBatch {
            conversation_id: conversation_id.to_string(),
            last_seq: outcome.last_seq,
            msgs: persist,
        };
        self.publish(&self.topics.to_store, key, &batch, metrics::STORE_PUBLISH_FAILED)
            .await;

        self.push_all(key, conversation_id, batch.msgs).await;
    }

    async fn push_all(&self, key: &str, conversation_id: &str, msgs: Vec<MsgData>) {
        for msg in msgs {
            if push_suppressed(key, &msg) {
                continue;
            }
            let event = PushMsgEvent {
                conversation_id: conversation_id.to_string(),
                msg,
            };
            self.publish(&self.topics.to_push, key, &event, metrics::PUSH_PUBLISH_FAILED)
                .await;
        }
    }

    /// Stores the highest seq each reader acknowledged, per conversation.
    async fn record_read_receipts(&self, msgs: &[MsgData]) {
        let mut by_conversation: HashMap<String, HashMap<String, i64>> = HashMap::new();
        for msg in msgs
            .iter()
            .filter(|m| m.content_type == content_type::HAS_READ_RECEIPT)
        {
            let tips: MarkAsReadTips = match serde_json::from_str(&msg.content) {
                Ok(tips) => tips,
                Err(e) => {
                    warn!(client_msg_id = %msg.client_msg_id, error = %e, "bad read receipt");
                    continue;
                }
            };
            let seq = tips.effective_seq();
            if seq <= 0 {
                continue;
            }
            let users = by_conversation.entry(tips.conversation_id).or_default();
            let current = users.entry(tips.mark_as_read_user_id).or_insert(seq);
            *current = (*current).max(seq);
        }

        for (conversation_id, users) in by_conversation {
            if let Err(e) = self.seqs.set_has_read_seqs(&conversation_id, &users).await {
                warn!(conversation_id, error = %e, "failed to store read receipts");
            }
        }
    }

    async fn publish<T: Serialize + Sync>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
        failure_metric: &'static str,
    ) {
        let result = match wire::encode(value) {
            Ok(bytes) => self.broker.publish(topic, key, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(topic, key, error = %e, "publish failed");
            self.metrics.incr_counter(failure_metric, 1);
        }
    }
}

#[async_trait]
impl BatchHandler<Vec<u8>> for TransferHandler {
    async fn handle(&self, lane: usize, key: &str, items: Vec<Vec<u8>>) {
        debug!(lane, key, records = items.len(), "lane slice");
        let msgs = self.decode(key, items);
        self.process(key, msgs).await;
    }
}
