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

//! Broker payloads
//!
//! Every topic carries bincode-encoded records keyed by the aggregation key,
//! so one conversation always lands on the same partition.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;
use crate::message::MsgData;

/// Push topic record: one message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMsgEvent {
    pub conversation_id: String,
    pub msg: MsgData,
}

/// Durable-store topic record. `last_seq` is the max seq before the batch
/// was allocated; the store uses it to locate the first free slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMsgBatch {
    pub conversation_id: String,
    pub last_seq: i64,
    pub msgs: Vec<MsgData>,
}

/// Modify topic record: reactions and edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyMsgBatch {
    pub conversation_id: String,
    pub msgs: Vec<MsgData>,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MsglineError;

    #[test]
    fn test_store_batch_decodes() {
        let batch = StoreMsgBatch {
            conversation_id: "sg_1".into(),
            last_seq: 9,
            msgs: vec![MsgData {
                seq: 10,
                content: "hi".into(),
                ..Default::default()
            }],
        };
        let bytes = encode(&batch).unwrap();
        let decoded: StoreMsgBatch = decode(&bytes).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = decode::<StoreMsgBatch>(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, MsglineError::Serialization(_)));
    }
}
