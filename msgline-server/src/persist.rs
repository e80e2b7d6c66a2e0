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

//! Durable-store consumer: writes allocated batches into the sharded log.

use std::sync::Arc;

use msgline_core::wire::{self, StoreMsgBatch};
use msgline_core::Result;
use msgline_storage::ShardedLogStore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::BrokerRecord;

pub struct PersistConsumer {
    log: Arc<ShardedLogStore>,
}

impl PersistConsumer {
    pub fn new(log: Arc<ShardedLogStore>) -> Self {
        Self { log }
    }

    pub async fn handle_record(&self, record: &BrokerRecord) -> Result<()> {
        let batch: StoreMsgBatch = wire::decode(&record.value)?;
        debug!(
            conversation_id = %batch.conversation_id,
            last_seq = batch.last_seq,
            len = batch.msgs.len(),
            "persisting batch"
        );
        self.log
            .batch_insert_chat2db(&batch.conversation_id, &batch.msgs, batch.last_seq)
            .await
    }

    async fn handle_logged(&self, record: &BrokerRecord) {
        if let Err(e) = self.handle_record(record).await {
            error!(key = %record.key, error = %e, "failed to persist batch");
        }
    }

    /// Consumes until the topic closes. On cancellation, records already
    /// delivered are written before returning.
    pub async fn run(&self, mut records: UnboundedReceiver<BrokerRecord>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Some(record) => self.handle_logged(&record).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    while let Ok(record) = records.try_recv() {
                        self.handle_logged(&record).await;
                    }
                    break;
                }
            }
        }
        info!("persist consumer stopped");
    }
}
