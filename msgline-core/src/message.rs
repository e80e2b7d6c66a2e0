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

//! Chat message model
//!
//! `MsgData` is the unit that flows through ingestion, the cache and the
//! sharded log. Everything except `seq`, `status` and `send_time` is opaque
//! payload from the point of view of this crate.

use serde::{Deserialize, Serialize};

/// Content type markers carried in `MsgData::content_type`.
pub mod content_type {
    pub const TEXT: i32 = 101;
    pub const PICTURE: i32 = 102;
    pub const TYPING: i32 = 113;
    pub const REVOKE_NOTIFICATION: i32 = 2101;
    pub const HAS_READ_RECEIPT: i32 = 2200;
    pub const REACTION_MODIFIER: i32 = 2303;
    pub const REACTION_DELETER: i32 = 2304;
    pub const EDIT: i32 = 2305;
}

/// Session types.
pub mod session_type {
    pub const SINGLE_CHAT: i32 = 1;
    pub const GROUP_CHAT: i32 = 2;
    pub const SUPER_GROUP_CHAT: i32 = 3;
    pub const NOTIFICATION_CHAT: i32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MsgStatus {
    #[default]
    Normal,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgOptions {
    /// Persist to the durable log.
    pub is_history: bool,
    /// Deliver to the sender's other devices.
    pub is_sender_sync: bool,
    pub is_offline_push: bool,
    pub is_unread_count: bool,
    /// Stored and pushed under the conversation's notification stream.
    #[serde(default)]
    pub is_notification: bool,
    /// A notification that also lands in the chat stream as a regular message.
    #[serde(default)]
    pub is_send_msg: bool,
}

impl Default for MsgOptions {
    fn default() -> Self {
        Self {
            is_history: true,
            is_sender_sync: true,
            is_offline_push: true,
            is_unread_count: true,
            is_notification: false,
            is_send_msg: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgData {
    pub send_id: String,
    pub recv_id: String,
    pub group_id: String,
    pub client_msg_id: String,
    pub server_msg_id: String,
    pub session_type: i32,
    pub content_type: i32,
    pub content: String,
    pub seq: i64,
    /// Milliseconds since epoch; zero once tombstoned.
    pub send_time: i64,
    pub create_time: i64,
    pub status: MsgStatus,
    pub options: MsgOptions,
    pub at_user_ids: Vec<String>,
    pub ex: String,
    /// Set on reads of single-chat messages the recipient has marked read.
    #[serde(default)]
    pub is_read: bool,
}

impl MsgData {
    /// Stand-in for a seq that cannot be served: carries the seq and nothing else.
    pub fn placeholder(seq: i64) -> Self {
        Self {
            seq,
            ..Default::default()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.content.is_empty() && self.send_time == 0 && self.client_msg_id.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.status == MsgStatus::Deleted
    }

    /// Reaction and edit notifications go to the modify topic.
    pub fn is_modify(&self) -> bool {
        matches!(
            self.content_type,
            content_type::REACTION_MODIFIER | content_type::REACTION_DELETER | content_type::EDIT
        )
    }

    pub fn is_group(&self) -> bool {
        matches!(
            self.session_type,
            session_type::GROUP_CHAT | session_type::SUPER_GROUP_CHAT
        )
    }
}

/// Notification stream paired with a chat conversation: the type tag before
/// the first `_` becomes `n`, so `si_a_b` pairs with `n_a_b`.
pub fn notification_conversation_id(conversation_id: &str) -> String {
    match conversation_id.split_once('_') {
        Some((_, rest)) => format!("n_{rest}"),
        None => format!("n_{conversation_id}"),
    }
}

/// Who revoked a message and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeInfo {
    pub role: i32,
    pub user_id: String,
    pub nickname: String,
    pub time: i64,
}

/// Content of a rendered revoke notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeTips {
    pub revoker_user_id: String,
    pub revoker_role: i32,
    pub revoker_nickname: String,
    pub revoke_time: i64,
    pub client_msg_id: String,
    pub seq: i64,
    pub is_admin_revoke: bool,
    pub session_type: i32,
}

/// Payload of a `HAS_READ_RECEIPT` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAsReadTips {
    pub conversation_id: String,
    pub mark_as_read_user_id: String,
    pub has_read_seq: i64,
    #[serde(default)]
    pub seqs: Vec<i64>,
}

impl MarkAsReadTips {
    /// Highest seq the user has read, taking explicit seqs into account.
    pub fn effective_seq(&self) -> i64 {
        self.seqs
            .iter()
            .copied()
            .fold(self.has_read_seq, i64::max)
    }
}

/// Messages returned by a pull, bracketed by the conversation's retained range.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PulledMsgs {
    pub min_seq: i64,
    pub max_seq: i64,
    pub msgs: Vec<MsgData>,
}
