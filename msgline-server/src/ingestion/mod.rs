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

//! Ingestion
//!
//! [`IngestRouter`] consumes the inbound topic, batches records by
//! conversation and routes each conversation to one lane. The lane body is
//! [`TransferHandler`].

pub mod batcher;
pub mod handler;

pub use batcher::{lane_of, BatchHandler, Batcher, BatcherConfig, BatcherStats};
pub use handler::{partition, Partitioned, TransferHandler};

use std::sync::Arc;

use msgline_core::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerRecord;

pub struct IngestRouter {
    batcher: Batcher<Vec<u8>>,
}

impl IngestRouter {
    pub fn start(config: BatcherConfig, handler: Arc<TransferHandler>) -> Self {
        let batcher = Batcher::start(config, handler);
        info!(
            lanes = batcher.lanes(),
            "ingest router started; conversations are pinned to lanes by hash"
        );
        Self { batcher }
    }

    /// Buffers one inbound record under its aggregation key.
    pub fn submit(&self, record: BrokerRecord) -> Result<()> {
        self.batcher.put(record.key, record.value)
    }

    /// Feeds inbound records to the batcher until cancelled or the topic
    /// closes. Records already delivered when cancelled are still buffered.
    pub async fn run(&self, mut inbound: UnboundedReceiver<BrokerRecord>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                record = inbound.recv() => match record {
                    Some(record) => self.submit_logged(record),
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    while let Ok(record) = inbound.try_recv() {
                        self.submit_logged(record);
                    }
                    break;
                }
            }
        }
        info!("ingest consumer stopped");
    }

    fn submit_logged(&self, record: BrokerRecord) {
        let key = record.key.clone();
        if let Err(e) = self.submit(record) {
            warn!(%key, error = %e, "inbound record rejected");
        }
    }

    pub fn stats(&self) -> BatcherStats {
        self.batcher.stats()
    }

    /// Flushes buffered records through the lanes and waits for them.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }
}
