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

//! Broker capability
//!
//! Every stage talks to topics through [`BrokerClient`]. [`MemoryBroker`]
//! delivers records to in-process subscribers and backs the single-process
//! binary and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use msgline_core::{MsglineError, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// One keyed record on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publishes one record. Retrying is left to the client implementation.
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<()>;
}

/// In-process fan-out broker.
///
/// Records published to a topic with no subscriber are dropped.
#[derive(Default)]
pub struct MemoryBroker {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BrokerRecord>>>>,
    failures: DashMap<String, u32>,
    published: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives every record published to `topic` from now on.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<BrokerRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Makes the next `n` publishes to `topic` fail.
    pub fn fail_next_publishes(&self, topic: &str, n: u32) {
        self.failures.insert(topic.to_string(), n);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn take_failure(&self, topic: &str) -> bool {
        match self.failures.get_mut(topic) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<()> {
        if self.take_failure(topic) {
            return Err(MsglineError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let record = BrokerRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            value,
        };
        let mut closed = false;
        if let Some(senders) = self.subscribers.read().get(topic) {
            for tx in senders {
                closed |= tx.send(record.clone()).is_err();
            }
        }
        if closed {
            self.subscribers
                .write()
                .entry(topic.to_string())
                .and_modify(|senders| senders.retain(|tx| !tx.is_closed()));
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic, key, "published record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe("to_push");

        broker.publish("to_push", "c1", vec![1]).await.unwrap();
        broker.publish("to_push", "c1", vec![2]).await.unwrap();
        broker.publish("to_store", "c1", vec![3]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().value, vec![1]);
        assert_eq!(rx.recv().await.unwrap().value, vec![2]);
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_per_topic() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes("to_push", 1);

        let err = broker.publish("to_push", "c1", vec![]).await.unwrap_err();
        assert!(matches!(err, MsglineError::Publish { .. }));
        broker.publish("to_push", "c1", vec![]).await.unwrap();
        broker.publish("to_store", "c1", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let broker = MemoryBroker::new();
        drop(broker.subscribe("to_push"));
        broker.publish("to_push", "c1", vec![1]).await.unwrap();
        assert!(broker.subscribers.read()["to_push"].is_empty());
    }
}
