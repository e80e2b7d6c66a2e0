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

//! Error type shared by every msgline crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MsglineError>;

#[derive(Error, Debug)]
pub enum MsglineError {
    /// Cache holds the not-found marker, or the store has no such record.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Batch of {len} messages exceeds shard capacity {capacity}")]
    BatchTooLarge { len: usize, capacity: usize },

    #[error("Batch contains no messages")]
    BatchTooShort,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Create raced with an existing document.
    #[error("Document already exists: {0}")]
    DocExists(String),

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Soft-delete retries exhausted; the keys may still be served stale.
    #[error("Cache invalidation of {} keys failed after {attempts} attempts: {reason}", keys.len())]
    Invalidation {
        keys: Vec<String>,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Component is shut down")]
    Shutdown,
}

impl MsglineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MsglineError::NotFound(_))
    }
}

impl From<serde_json::Error> for MsglineError {
    fn from(err: serde_json::Error) -> Self {
        MsglineError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MsglineError {
    fn from(err: bincode::Error) -> Self {
        MsglineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_message_counts_keys() {
        let err = MsglineError::Invalidation {
            keys: vec!["MSG:a_1".into(), "MSG:a_2".into()],
            attempts: 5,
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cache invalidation of 2 keys failed after 5 attempts: connection reset"
        );
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: MsglineError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, MsglineError::Serialization(_)));
        assert!(!err.is_not_found());
    }
}
