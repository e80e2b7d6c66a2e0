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

//! Periodic retention sweep over every stored conversation.

use std::sync::Arc;
use std::time::Duration;

use msgline_core::Result;
use msgline_storage::{RetentionCompactor, ShardedLogStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub conversations: usize,
    pub failed: usize,
}

pub struct RetentionScheduler {
    retention: Arc<RetentionCompactor>,
    log: Arc<ShardedLogStore>,
    interval: Duration,
    remain_secs: i64,
}

impl RetentionScheduler {
    pub fn new(
        retention: Arc<RetentionCompactor>,
        log: Arc<ShardedLogStore>,
        interval: Duration,
        remain_secs: i64,
    ) -> Self {
        Self {
            retention,
            log,
            interval,
            remain_secs,
        }
    }

    /// Compacts each conversation in turn, then checks its max seq against
    /// the store. One conversation failing does not stop the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let conversations = self.log.conversation_ids().await?;
        let mut report = SweepReport {
            conversations: conversations.len(),
            failed: 0,
        };

        for conversation_id in &conversations {
            match self.retention.compact(conversation_id, self.remain_secs).await {
                Ok(min_seq) => {
                    if let Err(e) = self.retention.check_max_seq_with_store(conversation_id).await {
                        warn!(%conversation_id, error = %e, "max seq check failed");
                    }
                    debug!(%conversation_id, min_seq, "compacted");
                }
                Err(e) => {
                    warn!(%conversation_id, error = %e, "compaction failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.interval.as_secs(),
            remain_secs = self.remain_secs,
            "retention scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.sweep().await {
                    Ok(report) => info!(
                        conversations = report.conversations,
                        failed = report.failed,
                        "retention sweep finished"
                    ),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                },
            }
        }
        info!("retention scheduler stopped");
    }
}
