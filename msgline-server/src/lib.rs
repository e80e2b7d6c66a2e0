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

//! Msgline Server
//!
//! Single-process message pipeline:
//!
//! ```text
//! to_transfer ─► IngestRouter ─► lane: TransferHandler ─┬─► to_modify
//!                                   │ (seqs + cache)    ├─► to_push
//!                                   ▼                   └─► to_store ─► PersistConsumer ─► ShardedLogStore
//!                              SeqAllocator
//! RetentionScheduler ─(interval)─► RetentionCompactor
//! ```

pub mod broker;
pub mod config;
pub mod ingestion;
pub mod persist;
pub mod retention_scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use msgline_core::SharedMetrics;
use msgline_storage::Storage;
use msgline_telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use broker::MemoryBroker;
use config::ServerConfig;
use ingestion::{IngestRouter, TransferHandler};
use persist::PersistConsumer;
use retention_scheduler::RetentionScheduler;

/// Running pipeline stages over one broker and one storage stack.
pub struct Pipeline {
    storage: Storage,
    router: Arc<IngestRouter>,
    ingest_stop: CancellationToken,
    background_stop: CancellationToken,
    ingest_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(
        config: &ServerConfig,
        storage: Storage,
        broker: Arc<MemoryBroker>,
        metrics: SharedMetrics,
    ) -> Self {
        let topics = &config.topics;
        let inbound = broker.subscribe(&topics.to_transfer);
        let stored = broker.subscribe(&topics.to_store);

        let handler = Arc::new(TransferHandler::new(
            storage.seqs.clone(),
            broker,
            topics.clone(),
            metrics,
        ));
        let router = Arc::new(IngestRouter::start(config.batcher_config(), handler));

        let ingest_stop = CancellationToken::new();
        let ingest_task = {
            let router = router.clone();
            let stop = ingest_stop.clone();
            tokio::spawn(async move { router.run(inbound, stop).await })
        };

        let background_stop = CancellationToken::new();
        let mut background = Vec::new();

        let consumer = PersistConsumer::new(storage.log.clone());
        let stop = background_stop.clone();
        background.push(tokio::spawn(async move { consumer.run(stored, stop).await }));

        if config.retention.enabled {
            let scheduler = RetentionScheduler::new(
                storage.retention.clone(),
                storage.log.clone(),
                Duration::from_secs(config.retention.interval_secs),
                config.retention.remain_secs,
            );
            let stop = background_stop.clone();
            background.push(tokio::spawn(async move { scheduler.run(stop).await }));
        }

        Self {
            storage,
            router,
            ingest_stop,
            background_stop,
            ingest_task,
            background,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn router(&self) -> &IngestRouter {
        &self.router
    }

    /// Stops intake, flushes the lanes, then lets the durable writer drain.
    pub async fn shutdown(self) {
        self.ingest_stop.cancel();
        if let Err(e) = self.ingest_task.await {
            warn!(error = %e, "ingest consumer task failed");
        }
        self.router.shutdown().await;

        self.background_stop.cancel();
        for task in self.background {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
    }
}

/// Run the msgline server until ctrl-c
pub async fn run_server(config: ServerConfig) -> Result<()> {
    config.validate()?;

    let metrics = init_telemetry(TelemetryConfig {
        service_name: &config.telemetry.service_name,
        otlp_endpoint: config.telemetry.otlp_endpoint.as_deref(),
        json_logs: config.telemetry.json_logs,
        default_filter: &config.telemetry.log_filter,
    })?;
    let metrics: SharedMetrics = Arc::new(metrics);

    info!(
        lanes = config.ingest.lanes,
        shard_capacity = config.storage.shard_capacity,
        retention_enabled = config.retention.enabled,
        "starting msgline"
    );

    let storage = Storage::in_memory(config.storage_options(), metrics.clone());
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = Pipeline::start(&config, storage, broker, metrics);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    pipeline.shutdown().await;
    shutdown_telemetry();
    info!("msgline stopped");
    Ok(())
}
