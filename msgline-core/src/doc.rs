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

//! Shard documents and shard arithmetic
//!
//! A conversation's log is split into documents of at most `capacity` slots.
//! Slot `i` of shard `k` always holds seq `k * capacity + i + 1`, so the
//! location of any seq is a pure function of the conversation ID and the seq.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{MsgData, MsgStatus, RevokeInfo};

/// Default number of message slots per shard document.
pub const SHARD_CAPACITY: usize = 5000;

/// Separator between conversation ID and shard index in a doc ID.
pub const DOC_ID_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgSlot {
    pub msg: Option<MsgData>,
    /// Set when the message was revoked; reads render it as a notification.
    pub revoke: Option<RevokeInfo>,
    /// Users who deleted the message for themselves only.
    #[serde(default)]
    pub del_list: Vec<String>,
    #[serde(default)]
    pub is_read: bool,
}

impl MsgSlot {
    pub fn new(msg: MsgData) -> Self {
        Self {
            msg: Some(msg),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.msg.is_none()
    }

    /// Clears the payload in place. The seq is kept so alignment survives.
    pub fn tombstone(&mut self) {
        if let Some(msg) = self.msg.as_mut() {
            let seq = msg.seq;
            *msg = MsgData::placeholder(seq);
            msg.status = MsgStatus::Deleted;
        }
        self.revoke = None;
        self.del_list.clear();
        self.is_read = false;
    }

    pub fn is_hidden_from(&self, user_id: &str) -> bool {
        self.del_list.iter().any(|id| id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDoc {
    pub doc_id: String,
    pub msgs: Vec<MsgSlot>,
}

impl MsgDoc {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            msgs: Vec::new(),
        }
    }

    /// All `capacity` slots are populated.
    pub fn is_full(&self, capacity: usize) -> bool {
        self.msgs.len() >= capacity && self.msgs.iter().take(capacity).all(|slot| !slot.is_empty())
    }

    /// Shard index parsed from the doc ID.
    pub fn index(&self) -> Option<i64> {
        parse_doc_id(&self.doc_id).map(|(_, index)| index)
    }

    pub fn last_msg(&self) -> Option<&MsgData> {
        self.msgs.iter().rev().find_map(|slot| slot.msg.as_ref())
    }
}

/// Shard index holding `seq`. Seqs start at 1.
pub fn shard_index(seq: i64, capacity: usize) -> i64 {
    (seq - 1).div_euclid(capacity as i64)
}

/// Position of `seq` within its shard.
pub fn msg_index(seq: i64, capacity: usize) -> usize {
    (seq - 1).rem_euclid(capacity as i64) as usize
}

pub fn doc_id_for_index(conversation_id: &str, index: i64) -> String {
    format!("{conversation_id}{DOC_ID_SEPARATOR}{index}")
}

pub fn doc_id(conversation_id: &str, seq: i64, capacity: usize) -> String {
    doc_id_for_index(conversation_id, shard_index(seq, capacity))
}

/// Splits `conv:index` at the last separator; conversation IDs may contain ':'.
pub fn parse_doc_id(doc_id: &str) -> Option<(&str, i64)> {
    let (conversation_id, index) = doc_id.rsplit_once(DOC_ID_SEPARATOR)?;
    let index = index.parse().ok()?;
    Some((conversation_id, index))
}

/// Groups seqs by the doc that holds them, keeping input order within a doc.
pub fn doc_ids_seqs_map(
    conversation_id: &str,
    seqs: &[i64],
    capacity: usize,
) -> BTreeMap<i64, (String, Vec<i64>)> {
    let mut grouped: BTreeMap<i64, (String, Vec<i64>)> = BTreeMap::new();
    for &seq in seqs {
        let index = shard_index(seq, capacity);
        grouped
            .entry(index)
            .or_insert_with(|| (doc_id_for_index(conversation_id, index), Vec::new()))
            .1
            .push(seq);
    }
    grouped
}

/// First and last seq a shard can hold.
pub fn shard_seq_range(index: i64, capacity: usize) -> (i64, i64) {
    let cap = capacity as i64;
    (index * cap + 1, (index + 1) * cap)
}
