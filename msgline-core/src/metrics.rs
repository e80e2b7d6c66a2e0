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

//! Metrics interface
//!
//! Components take an `Arc<dyn MetricsCollector>` instead of touching
//! process-wide instruments. The OpenTelemetry implementation lives in
//! `msgline-telemetry`; `InMemoryMetrics` backs tests.

use std::sync::Arc;

use dashmap::DashMap;

pub const MSG_INSERT_CACHE_SUCCESS: &str = "msgline.cache.insert.success";
pub const MSG_INSERT_CACHE_FAILED: &str = "msgline.cache.insert.failed";
pub const SEQ_SET_FAILED: &str = "msgline.seq.set_failed";
pub const NEW_CONVERSATIONS: &str = "msgline.conversations.new";
pub const INGEST_RECORDS: &str = "msgline.ingest.records";
pub const INGEST_DECODE_FAILED: &str = "msgline.ingest.decode_failed";
pub const INGEST_BATCH_REJECTED: &str = "msgline.ingest.batch_rejected";
pub const PUSH_PUBLISH_FAILED: &str = "msgline.publish.push_failed";
pub const STORE_PUBLISH_FAILED: &str = "msgline.publish.store_failed";
pub const MODIFY_PUBLISH_FAILED: &str = "msgline.publish.modify_failed";
pub const MSG_INSERT_STORE_SUCCESS: &str = "msgline.store.insert.success";
pub const MSG_INSERT_STORE_FAILED: &str = "msgline.store.insert.failed";
pub const CACHE_INVALIDATION_FAILED: &str = "msgline.cache.invalidation_failed";
pub const READ_PLACEHOLDERS: &str = "msgline.read.placeholders";
pub const RETENTION_DOCS_DELETED: &str = "msgline.retention.docs_deleted";
pub const RETENTION_MSGS_TOMBSTONED: &str = "msgline.retention.msgs_tombstoned";
pub const SEQ_DRIFT: &str = "msgline.seq.drift";

pub trait MetricsCollector: Send + Sync {
    fn incr_counter(&self, name: &'static str, value: u64);

    fn set_gauge(&self, name: &'static str, value: i64);
}

pub type SharedMetrics = Arc<dyn MetricsCollector>;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}

    fn set_gauge(&self, _name: &'static str, _value: i64) {}
}

pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Keeps every counter and gauge in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<&'static str, u64>,
    gauges: DashMap<&'static str, i64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<i64> {
        self.gauges.get(name).map(|v| *v)
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn incr_counter(&self, name: &'static str, value: u64) {
        *self.counters.entry(name).or_insert(0) += value;
    }

    fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauges.insert(name, value);
    }
}
