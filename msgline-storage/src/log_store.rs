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

//! Capacity-sharded durable message log
//!
//! ## Layout
//!
//! Each conversation is a sequence of documents `conv:0`, `conv:1`, ...
//! holding at most `capacity` slots each. Slot positions are fixed by seq,
//! so a batch starting right after `current_max_seq` always lands at
//! `msg_index(current_max_seq + 1)` of `doc_id(current_max_seq + 1)`.
//!
//! ## Writes
//!
//! A batch never exceeds `capacity`, so it touches at most two shards: the
//! remainder of the current one and the head of the next. Slots are written
//! positionally, which makes redelivery of the same batch idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use msgline_core::doc::{self, doc_ids_seqs_map};
use msgline_core::keys::{msg_key, user_del_list_key};
use msgline_core::message::{content_type, RevokeTips};
use msgline_core::metrics::{self, SharedMetrics};
use msgline_core::{MsgData, MsgDoc, MsgSlot, MsglineError, Result, RevokeInfo};
use tracing::{debug, info, warn};

use crate::cache::CacheAside;
use crate::doc_store::DocStore;
use crate::locks::ConversationLocks;

pub struct ShardedLogStore {
    store: Arc<dyn DocStore>,
    aside: CacheAside,
    locks: Arc<ConversationLocks>,
    capacity: usize,
    metrics: SharedMetrics,
}

impl ShardedLogStore {
    pub fn new(
        store: Arc<dyn DocStore>,
        aside: CacheAside,
        locks: Arc<ConversationLocks>,
        capacity: usize,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            aside,
            locks,
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<ConversationLocks> {
        &self.locks
    }

    pub fn doc_id(&self, conversation_id: &str, seq: i64) -> String {
        doc::doc_id(conversation_id, seq, self.capacity)
    }

    pub fn msg_index(&self, seq: i64) -> usize {
        doc::msg_index(seq, self.capacity)
    }

    /// Writes slots into an existing shard starting at `start_index`.
    pub async fn push_msgs_to_doc(
        &self,
        doc_id: &str,
        start_index: usize,
        msgs: &[MsgData],
    ) -> Result<()> {
        let slots = msgs.iter().cloned().map(MsgSlot::new).collect();
        if self.store.write_slots(doc_id, start_index, slots).await? {
            Ok(())
        } else {
            Err(MsglineError::NotFound(doc_id.to_string()))
        }
    }

    /// Persists a batch whose first message has seq `current_max_seq + 1`.
    pub async fn batch_insert_chat2db(
        &self,
        conversation_id: &str,
        msgs: &[MsgData],
        current_max_seq: i64,
    ) -> Result<()> {
        if msgs.is_empty() {
            return Err(MsglineError::BatchTooShort);
        }
        if msgs.len() > self.capacity {
            return Err(MsglineError::BatchTooLarge {
                len: msgs.len(),
                capacity: self.capacity,
            });
        }
        if let Some((offset, msg)) = msgs
            .iter()
            .enumerate()
            .find(|(offset, msg)| msg.seq != current_max_seq + *offset as i64 + 1)
        {
            return Err(MsglineError::InvalidArgument(format!(
                "message {offset} of {conversation_id} has seq {}, expected {}",
                msg.seq,
                current_max_seq + offset as i64 + 1
            )));
        }

        let _guard = self.locks.lock(conversation_id).await;

        let remain = self.capacity - (current_max_seq.rem_euclid(self.capacity as i64)) as usize;
        let (head, tail) = msgs.split_at(remain.min(msgs.len()));

        let result: Result<()> = async {
            self.write_shard(conversation_id, current_max_seq + 1, head)
                .await?;
            if !tail.is_empty() {
                self.write_shard(conversation_id, current_max_seq + head.len() as i64 + 1, tail)
                    .await?;
            }
            Ok(())
        }
        .await;

        match &result {
            Ok(()) => {
                self.metrics
                    .incr_counter(metrics::MSG_INSERT_STORE_SUCCESS, msgs.len() as u64);
                debug!(
                    conversation_id,
                    first_seq = current_max_seq + 1,
                    count = msgs.len(),
                    "persisted messages"
                );
            }
            Err(e) => {
                self.metrics
                    .incr_counter(metrics::MSG_INSERT_STORE_FAILED, msgs.len() as u64);
                warn!(conversation_id, current_max_seq, error = %e, "failed to persist messages");
            }
        }
        result
    }

    /// Writes messages that all fall in the shard of `first_seq`, creating
    /// the shard if needed.
    async fn write_shard(&self, conversation_id: &str, first_seq: i64, msgs: &[MsgData]) -> Result<()> {
        let doc_id = self.doc_id(conversation_id, first_seq);
        let start = self.msg_index(first_seq);

        match self.push_msgs_to_doc(&doc_id, start, msgs).await {
            Err(MsglineError::NotFound(_)) => {}
            other => return other,
        }

        let mut doc = MsgDoc::new(doc_id.clone());
        doc.msgs = vec![MsgSlot::default(); start];
        doc.msgs.extend(msgs.iter().cloned().map(MsgSlot::new));

        match self.store.create(doc).await {
            Ok(()) => {
                info!(conversation_id, doc_id = %doc_id, "created shard");
                Ok(())
            }
            Err(MsglineError::DocExists(_)) => {
                // Lost a create race with another writer; append instead.
                self.push_msgs_to_doc(&doc_id, start, msgs).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn find_one_by_doc_id(&self, doc_id: &str) -> Result<Option<MsgDoc>> {
        self.store.find_one(doc_id).await
    }

    /// Messages for `seqs` found in `doc_id`, revocations rendered.
    /// Seqs the doc does not hold are simply absent from the result.
    pub async fn get_msg_by_seq_index_in_1doc(
        &self,
        conversation_id: &str,
        doc_id: &str,
        seqs: &[i64],
    ) -> Result<Vec<MsgData>> {
        let Some(doc) = self.store.find_one(doc_id).await? else {
            return Ok(Vec::new());
        };

        let mut found = Vec::with_capacity(seqs.len());
        for &seq in seqs {
            if let Some(slot) = self.find_slot(&doc, seq) {
                if let Some(msg) = render_slot(conversation_id, slot) {
                    found.push(msg);
                }
            }
        }
        Ok(found)
    }

    /// Position of `seq` in `doc`, normally its aligned index.
    fn slot_position(&self, doc: &MsgDoc, seq: i64) -> Option<usize> {
        let holds = |slot: &MsgSlot| slot.msg.as_ref().is_some_and(|m| m.seq == seq);
        let aligned = self.msg_index(seq);
        match doc.msgs.get(aligned) {
            Some(slot) if holds(slot) => Some(aligned),
            _ => doc.msgs.iter().position(holds),
        }
    }

    fn find_slot<'a>(&self, doc: &'a MsgDoc, seq: i64) -> Option<&'a MsgSlot> {
        self.slot_position(doc, seq).map(|index| &doc.msgs[index])
    }

    pub async fn get_newest_msg(&self, conversation_id: &str) -> Result<Option<MsgData>> {
        self.edge_msg(conversation_id, false).await
    }

    pub async fn get_oldest_msg(&self, conversation_id: &str) -> Result<Option<MsgData>> {
        self.edge_msg(conversation_id, true).await
    }

    /// First (or last) populated slot, walking shards in order and skipping
    /// shards with no populated slot.
    async fn edge_msg(&self, conversation_id: &str, ascending: bool) -> Result<Option<MsgData>> {
        let mut skip = 0;
        while let Some(doc) = self
            .store
            .find_doc_by_order(conversation_id, skip, ascending)
            .await?
        {
            let msg = if ascending {
                doc.msgs.iter().find_map(|slot| slot.msg.clone())
            } else {
                doc.msgs.iter().rev().find_map(|slot| slot.msg.clone())
            };
            if msg.is_some() {
                return Ok(msg);
            }
            skip += 1;
        }
        Ok(None)
    }

    /// Seqs of the oldest and newest stored messages, 0 when empty.
    pub async fn get_min_max_seq_in_store(&self, conversation_id: &str) -> Result<(i64, i64)> {
        let min = self
            .get_oldest_msg(conversation_id)
            .await?
            .map_or(0, |m| m.seq);
        let max = self
            .get_newest_msg(conversation_id)
            .await?
            .map_or(0, |m| m.seq);
        Ok((min, max))
    }

    pub async fn conversation_ids(&self) -> Result<Vec<String>> {
        self.store.list_conversations().await
    }

    /// Tombstones the slots at `indexes`; returns the seqs that were cleared.
    pub async fn tombstone_msgs_in_doc(&self, doc_id: &str, indexes: &[usize]) -> Result<Vec<i64>> {
        let (conversation_id, _) = doc::parse_doc_id(doc_id)
            .ok_or_else(|| MsglineError::InvalidArgument(format!("malformed doc id {doc_id}")))?;
        let _guard = self.locks.lock(conversation_id).await;
        self.tombstone_slots(doc_id, indexes).await
    }

    /// Caller holds the conversation's stripe.
    async fn tombstone_slots(&self, doc_id: &str, indexes: &[usize]) -> Result<Vec<i64>> {
        let Some(doc) = self.store.find_one(doc_id).await? else {
            return Ok(Vec::new());
        };

        let mut updates = Vec::with_capacity(indexes.len());
        let mut seqs = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let Some(slot) = doc.msgs.get(index) else {
                continue;
            };
            let Some(seq) = slot.msg.as_ref().map(|m| m.seq) else {
                continue;
            };
            let mut slot = slot.clone();
            slot.tombstone();
            updates.push((index, slot));
            seqs.push(seq);
        }

        if !updates.is_empty() {
            self.store.update_slots(doc_id, updates).await?;
        }
        Ok(seqs)
    }

    /// Marks a stored message revoked and invalidates its cached envelope.
    /// Tombstoned messages cannot be revoked.
    pub async fn revoke_msg(&self, conversation_id: &str, seq: i64, revoke: RevokeInfo) -> Result<()> {
        let doc_id = self.doc_id(conversation_id, seq);
        {
            let _guard = self.locks.lock(conversation_id).await;
            let doc = self
                .store
                .find_one(&doc_id)
                .await?
                .ok_or_else(|| MsglineError::NotFound(doc_id.clone()))?;

            let index = self
                .slot_position(&doc, seq)
                .filter(|&index| doc.msgs[index].msg.as_ref().is_some_and(|m| !m.is_deleted()))
                .ok_or_else(|| MsglineError::NotFound(msg_key(conversation_id, seq)))?;
            let mut slot = doc.msgs[index].clone();
            slot.revoke = Some(revoke);
            self.store.update_slots(&doc_id, vec![(index, slot)]).await?;
        }

        let mut pending = self.aside.invalidation();
        pending.add_keys([msg_key(conversation_id, seq)]);
        pending.exec_del().await
    }

    /// Tombstones `seqs` in place and invalidates their cached envelopes.
    pub async fn delete_msgs_physical_by_seqs(&self, conversation_id: &str, seqs: &[i64]) -> Result<()> {
        let mut pending = self.aside.invalidation();
        {
            let _guard = self.locks.lock(conversation_id).await;
            for (doc_id, doc_seqs) in doc_ids_seqs_map(conversation_id, seqs, self.capacity).into_values() {
                let indexes: Vec<usize> = doc_seqs.iter().map(|&seq| self.msg_index(seq)).collect();
                let cleared = self.tombstone_slots(&doc_id, &indexes).await?;
                pending.add_keys(cleared.into_iter().map(|seq| msg_key(conversation_id, seq)));
            }
        }
        pending.exec_del().await
    }

    /// Applies `edit` to the slot of every seq in `seqs` that holds a live
    /// message, under the conversation's stripe. Returns the edited seqs.
    async fn edit_live_slots<F>(&self, conversation_id: &str, seqs: &[i64], mut edit: F) -> Result<Vec<i64>>
    where
        F: FnMut(&mut MsgSlot) -> bool,
    {
        let _guard = self.locks.lock(conversation_id).await;
        let mut edited = Vec::new();
        for (doc_id, doc_seqs) in doc_ids_seqs_map(conversation_id, seqs, self.capacity).into_values() {
            let Some(doc) = self.store.find_one(&doc_id).await? else {
                continue;
            };
            let mut updates = Vec::new();
            for seq in doc_seqs {
                let Some(index) = self.slot_position(&doc, seq) else {
                    continue;
                };
                let mut slot = doc.msgs[index].clone();
                if slot.msg.as_ref().map_or(true, |m| m.is_deleted()) || !edit(&mut slot) {
                    continue;
                }
                updates.push((index, slot));
                edited.push(seq);
            }
            if !updates.is_empty() {
                self.store.update_slots(&doc_id, updates).await?;
            }
        }
        Ok(edited)
    }

    /// Hides `seqs` from `user_id` only. Other members keep seeing them.
    pub async fn delete_user_msgs_by_seqs(
        &self,
        conversation_id: &str,
        user_id: &str,
        seqs: &[i64],
    ) -> Result<Vec<i64>> {
        let hidden = self
            .edit_live_slots(conversation_id, seqs, |slot| {
                if slot.is_hidden_from(user_id) {
                    return false;
                }
                slot.del_list.push(user_id.to_string());
                true
            })
            .await?;
        debug!(conversation_id, user_id, hidden = hidden.len(), "user deleted messages");

        let mut pending = self.aside.invalidation();
        pending.add_keys([user_del_list_key(conversation_id, user_id)]);
        pending.exec_del().await?;
        Ok(hidden)
    }

    /// Every seq `user_id` deleted for themselves, ascending.
    pub async fn user_deleted_seqs(&self, conversation_id: &str, user_id: &str) -> Result<Vec<i64>> {
        let mut seqs = Vec::new();
        let mut skip = 0;
        while let Some(doc) = self
            .store
            .find_doc_by_order(conversation_id, skip, true)
            .await?
        {
            seqs.extend(
                doc.msgs
                    .iter()
                    .filter(|slot| slot.is_hidden_from(user_id))
                    .filter_map(|slot| slot.msg.as_ref().map(|m| m.seq)),
            );
            skip += 1;
        }
        Ok(seqs)
    }

    /// Marks single-chat messages read by `user_id`. The user's own
    /// messages are left alone.
    pub async fn mark_single_chat_msgs_as_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        seqs: &[i64],
    ) -> Result<Vec<i64>> {
        let marked = self
            .edit_live_slots(conversation_id, seqs, |slot| {
                let from_other = slot.msg.as_ref().is_some_and(|m| m.send_id != user_id);
                if !from_other || slot.is_read {
                    return false;
                }
                slot.is_read = true;
                true
            })
            .await?;
        debug!(conversation_id, user_id, marked = marked.len(), "marked messages read");

        let mut pending = self.aside.invalidation();
        pending.add_keys(marked.iter().map(|&seq| msg_key(conversation_id, seq)));
        pending.exec_del().await?;
        Ok(marked)
    }

    /// Seqs whose self-destruct deadline has passed for `user_id`, oldest
    /// first. The walk stops at the first message still inside its window;
    /// messages that expired at or before `last_destruct_ms` were handled
    /// by an earlier run, and messages the user already deleted are skipped.
    pub async fn user_destruct_seqs(
        &self,
        conversation_id: &str,
        user_id: &str,
        destruct_secs: i64,
        last_destruct_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<i64>> {
        let mut seqs = Vec::new();
        let mut skip = 0;
        while let Some(doc) = self
            .store
            .find_doc_by_order(conversation_id, skip, true)
            .await?
        {
            for slot in &doc.msgs {
                let Some(msg) = slot.msg.as_ref() else {
                    continue;
                };
                let deadline = msg.send_time + destruct_secs * 1000;
                if deadline > now_ms {
                    return Ok(seqs);
                }
                if deadline > last_destruct_ms && !slot.is_hidden_from(user_id) {
                    seqs.push(msg.seq);
                }
            }
            skip += 1;
        }
        Ok(seqs)
    }

    pub async fn delete_docs(&self, doc_ids: &[String]) -> Result<u64> {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        self.store.delete_docs(doc_ids).await
    }

    /// Loads messages for `seqs` shard by shard. A seq missing from its
    /// computed shard is retried against the next shard.
    pub async fn find_msgs_by_seqs(&self, conversation_id: &str, seqs: &[i64]) -> Result<HashMap<i64, MsgData>> {
        let mut found = HashMap::with_capacity(seqs.len());
        for (index, (doc_id, doc_seqs)) in doc_ids_seqs_map(conversation_id, seqs, self.capacity) {
            for msg in self
                .get_msg_by_seq_index_in_1doc(conversation_id, &doc_id, &doc_seqs)
                .await?
            {
                found.insert(msg.seq, msg);
            }

            let stragglers: Vec<i64> = doc_seqs
                .into_iter()
                .filter(|seq| !found.contains_key(seq))
                .collect();
            if stragglers.is_empty() {
                continue;
            }
            let next = doc::doc_id_for_index(conversation_id, index + 1);
            for msg in self
                .get_msg_by_seq_index_in_1doc(conversation_id, &next, &stragglers)
                .await?
            {
                found.insert(msg.seq, msg);
            }
        }
        Ok(found)
    }
}

/// Slot payload as served to readers. Revoked slots become notifications.
fn render_slot(conversation_id: &str, slot: &MsgSlot) -> Option<MsgData> {
    let msg = slot.msg.as_ref()?;
    let Some(revoke) = &slot.revoke else {
        let mut msg = msg.clone();
        msg.is_read = slot.is_read;
        return Some(msg);
    };

    let tips = RevokeTips {
        revoker_user_id: revoke.user_id.clone(),
        revoker_role: revoke.role,
        revoker_nickname: revoke.nickname.clone(),
        revoke_time: revoke.time,
        client_msg_id: msg.client_msg_id.clone(),
        seq: msg.seq,
        is_admin_revoke: revoke.user_id != msg.send_id,
        session_type: msg.session_type,
    };
    let content = match serde_json::to_string(&tips) {
        Ok(content) => content,
        Err(e) => {
            warn!(conversation_id, seq = msg.seq, error = %e, "failed to render revoke tips");
            String::new()
        }
    };

    let mut rendered = msg.clone();
    rendered.is_read = slot.is_read;
    rendered.content_type = content_type::REVOKE_NOTIFICATION;
    rendered.content = content;
    Some(rendered)
}
