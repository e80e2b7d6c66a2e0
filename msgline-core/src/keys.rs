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

//! Cache key layout.

pub const MAX_SEQ_PREFIX: &str = "MAXSEQ:";
pub const MIN_SEQ_PREFIX: &str = "MINSEQ:";
pub const HAS_READ_SEQ_PREFIX: &str = "HAS_READ_SEQ:";
pub const MSG_PREFIX: &str = "MSG:";
pub const USER_MIN_SEQ_PREFIX: &str = "CON_USER_MIN_SEQ:";
pub const USER_MAX_SEQ_PREFIX: &str = "CON_USER_MAX_SEQ:";
pub const USER_DEL_LIST_PREFIX: &str = "USER_DEL_LIST:";

pub fn max_seq_key(conversation_id: &str) -> String {
    format!("{MAX_SEQ_PREFIX}{conversation_id}")
}

pub fn min_seq_key(conversation_id: &str) -> String {
    format!("{MIN_SEQ_PREFIX}{conversation_id}")
}

pub fn has_read_seq_key(conversation_id: &str, user_id: &str) -> String {
    format!("{HAS_READ_SEQ_PREFIX}{conversation_id}:{user_id}")
}

pub fn user_min_seq_key(conversation_id: &str, user_id: &str) -> String {
    format!("{USER_MIN_SEQ_PREFIX}{conversation_id}:{user_id}")
}

pub fn user_max_seq_key(conversation_id: &str, user_id: &str) -> String {
    format!("{USER_MAX_SEQ_PREFIX}{conversation_id}:{user_id}")
}

/// Seqs one user deleted for themselves.
pub fn user_del_list_key(conversation_id: &str, user_id: &str) -> String {
    format!("{USER_DEL_LIST_PREFIX}{conversation_id}:{user_id}")
}

pub fn msg_key(conversation_id: &str, seq: i64) -> String {
    format!("{MSG_PREFIX}{conversation_id}_{seq}")
}

/// Prefix shared by every cached envelope of one conversation. Conversation
/// ids may themselves contain `_`, so keys of `si_a_b` also carry the prefix
/// of `si_a`; use [`msg_key_seq`] to tell them apart.
pub fn msg_key_prefix(conversation_id: &str) -> String {
    format!("{MSG_PREFIX}{conversation_id}_")
}

/// The seq of `key` if it is an envelope key of exactly `conversation_id`.
pub fn msg_key_seq(conversation_id: &str, key: &str) -> Option<i64> {
    let rest = key
        .strip_prefix(MSG_PREFIX)?
        .strip_prefix(conversation_id)?
        .strip_prefix('_')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}
