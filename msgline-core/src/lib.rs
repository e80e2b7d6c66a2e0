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

//! Msgline Core
//!
//! Shared data model for the message sequencing and storage pipeline:
//! messages, shard documents and their arithmetic, cache key layout, broker
//! payloads, the crate-wide error type and the metrics interface.

pub mod doc;
pub mod error;
pub mod keys;
pub mod message;
pub mod metrics;
pub mod wire;

pub use doc::{MsgDoc, MsgSlot, SHARD_CAPACITY};
pub use error::{MsglineError, Result};
pub use message::{MsgData, MsgOptions, MsgStatus, PulledMsgs, RevokeInfo};
pub use metrics::{MetricsCollector, SharedMetrics};

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
