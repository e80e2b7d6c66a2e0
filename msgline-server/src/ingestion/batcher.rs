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

//! Keyed micro-batching with hash-routed lanes
//!
//! ```text
//! put ─► accumulator ─(tick)─► pages ─► distribution ─► lane[xxhash(key) % N] ─► handler
//! ```
//!
//! The accumulator is a `parking_lot` mutex held only to append or swap. A
//! ticker drains it into pages of bounded size. The distribution task groups
//! each page by key, preserving arrival order within a key, and hands each
//! slice to the lane its key hashes to. Lanes have bounded mailboxes, so a
//! slow lane applies backpressure to distribution without reordering a key.
//!
//! Changing the lane count remaps keys to different lanes. Records already
//! queued under the old mapping and new records under the new one can then be
//! handled concurrently for the same key.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msgline_core::{MsglineError, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

/// Configuration for the batcher
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// How often the accumulator is drained
    pub interval: Duration,
    /// Maximum records per page handed to distribution
    pub page_size: usize,
    /// Number of lanes (worker tasks)
    pub lanes: usize,
    /// Mailbox capacity of each lane
    pub lane_capacity: usize,
    /// Pages buffered between the ticker and distribution
    pub page_buffer: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            page_size: 1000,
            lanes: 100,
            lane_capacity: 50,
            page_buffer: 500,
        }
    }
}

/// Lane body. All items for one key arrive at one lane, in arrival order.
#[async_trait]
pub trait BatchHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, lane: usize, key: &str, items: Vec<T>);
}

struct Keyed<T> {
    key: String,
    item: T,
}

struct KeyedSlice<T> {
    key: String,
    items: Vec<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub records: u64,
    pub pages: u64,
    pub slices: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct BatcherStatsInternal {
    records: AtomicU64,
    pages: AtomicU64,
    slices: AtomicU64,
}

pub struct Batcher<T> {
    accumulator: Arc<Mutex<Vec<Keyed<T>>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<BatcherStatsInternal>,
    lanes: usize,
}

impl<T: Send + 'static> Batcher<T> {
    /// Spawns the dispatcher, the distribution task and one task per lane.
    pub fn start<H: BatchHandler<T>>(config: BatcherConfig, handler: Arc<H>) -> Self {
        let lanes = config.lanes.max(1);
        let page_size = config.page_size.max(1);
        let accumulator = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(BatcherStatsInternal::default());
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(lanes + 2);

        let (pages_tx, pages_rx) = mpsc::channel(config.page_buffer.max(1));
        tasks.push(tokio::spawn(dispatch_loop(
            accumulator.clone(),
            pages_tx,
            config.interval,
            page_size,
            shutdown.clone(),
            stats.clone(),
        )));

        let mut lane_txs = Vec::with_capacity(lanes);
        let mut lane_tasks = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(config.lane_capacity.max(1));
            lane_txs.push(tx);
            lane_tasks.push(tokio::spawn(lane_loop(lane, rx, handler.clone(), stats.clone())));
        }
        tasks.push(tokio::spawn(distribute_loop(pages_rx, lane_txs)));
        tasks.extend(lane_tasks);

        info!(
            lanes,
            page_size,
            interval_ms = config.interval.as_millis() as u64,
            "batcher started"
        );

        Self {
            accumulator,
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(tasks),
            stats,
            lanes,
        }
    }

    pub fn put(&self, key: impl Into<String>, item: T) -> Result<()> {
        let mut acc = self.accumulator.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(MsglineError::Shutdown);
        }
        acc.push(Keyed {
            key: key.into(),
            item,
        });
        self.stats.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            records: self.stats.records.load(Ordering::Relaxed),
            pages: self.stats.pages.load(Ordering::Relaxed),
            slices: self.stats.slices.load(Ordering::Relaxed),
            pending: self.accumulator.lock().len(),
        }
    }

    /// Rejects further puts, flushes what is buffered and waits for every
    /// lane to finish its mailbox.
    pub async fn shutdown(&self) {
        {
            let _acc = self.accumulator.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "batcher task failed");
            }
        }
        info!("batcher stopped");
    }
}

/// Lane a key is routed to.
pub fn lane_of(key: &str, lanes: usize) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Groups by key in first-seen order, keeping arrival order within a key.
fn group_by_key<T>(records: Vec<Keyed<T>>) -> Vec<KeyedSlice<T>> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut slices: Vec<KeyedSlice<T>> = Vec::new();
    for Keyed { key, item } in records {
        match positions.get(&key) {
            Some(&pos) => slices[pos].items.push(item),
            None => {
                positions.insert(key.clone(), slices.len());
                slices.push(KeyedSlice {
                    key,
                    items: vec![item],
                });
            }
        }
    }
    slices
}

async fn dispatch_loop<T: Send + 'static>(
    accumulator: Arc<Mutex<Vec<Keyed<T>>>>,
    pages_tx: mpsc::Sender<Vec<Keyed<T>>>,
    interval: Duration,
    page_size: usize,
    shutdown: CancellationToken,
    stats: Arc<BatcherStatsInternal>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => flush(&accumulator, &pages_tx, page_size, &stats).await,
            _ = shutdown.cancelled() => {
                flush(&accumulator, &pages_tx, page_size, &stats).await;
                break;
            }
        }
    }
    debug!("dispatcher stopped");
}

async fn flush<T>(
    accumulator: &Mutex<Vec<Keyed<T>>>,
    pages_tx: &mpsc::Sender<Vec<Keyed<T>>>,
    page_size: usize,
    stats: &BatcherStatsInternal,
) {
    let drained = std::mem::take(&mut *accumulator.lock());
    if drained.is_empty() {
        return;
    }

    let mut page = Vec::with_capacity(page_size.min(drained.len()));
    for record in drained {
        page.push(record);
        if page.len() == page_size {
            send_page(pages_tx, std::mem::take(&mut page), stats).await;
        }
    }
    if !page.is_empty() {
        send_page(pages_tx, page, stats).await;
    }
}

async fn send_page<T>(
    pages_tx: &mpsc::Sender<Vec<Keyed<T>>>,
    page: Vec<Keyed<T>>,
    stats: &BatcherStatsInternal,
) {
    let len = page.len();
    if pages_tx.send(page).await.is_err() {
        warn!(records = len, "distribution stopped, dropping page");
        return;
    }
    stats.pages.fetch_add(1, Ordering::Relaxed);
}

async fn distribute_loop<T: Send + 'static>(
    mut pages_rx: mpsc::Receiver<Vec<Keyed<T>>>,
    lane_txs: Vec<mpsc::Sender<KeyedSlice<T>>>,
) {
    while let Some(page) = pages_rx.recv().await {
        for slice in group_by_key(page) {
            let lane = lane_of(&slice.key, lane_txs.len());
            if let Err(e) = lane_txs[lane].send(slice).await {
                warn!(lane, key = %e.0.key, "lane stopped, dropping slice");
            }
        }
    }
    debug!("distribution stopped");
}

async fn lane_loop<T: Send + 'static, H: BatchHandler<T>>(
    lane: usize,
    mut rx: mpsc::Receiver<KeyedSlice<T>>,
    handler: Arc<H>,
    stats: Arc<BatcherStatsInternal>,
) {
    while let Some(slice) = rx.recv().await {
        stats.slices.fetch_add(1, Ordering::Relaxed);
        handler.handle(lane, &slice.key, slice.items).await;
    }
    debug!(lane, "lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, String, Vec<u32>)>>,
    }

    #[async_trait]
    impl BatchHandler<u32> for Recorder {
        async fn handle(&self, lane: usize, key: &str, items: Vec<u32>) {
            self.seen.lock().push((lane, key.to_string(), items));
        }
    }

    fn config(lanes: usize, page_size: usize) -> BatcherConfig {
        BatcherConfig {
            interval: Duration::from_millis(10),
            page_size,
            lanes,
            lane_capacity: 4,
            page_buffer: 4,
        }
    }

    #[test]
    fn test_lane_of_is_stable_and_bounded() {
        for key in ["sg_1", "si_a_b", "n_x"] {
            assert_eq!(lane_of(key, 100), lane_of(key, 100));
            assert!(lane_of(key, 100) < 100);
        }
        assert_eq!(lane_of("anything", 1), 0);
    }

    #[test]
    fn test_group_by_key_keeps_arrival_order() {
        let records = [("a", 1), ("b", 2), ("a", 3), ("c", 4), ("b", 5)]
            .into_iter()
            .map(|(key, item)| Keyed {
                key: key.to_string(),
                item,
            })
            .collect();
        let slices: Vec<_> = group_by_key(records)
            .into_iter()
            .map(|s| (s.key, s.items))
            .collect();
        assert_eq!(
            slices,
            vec![
                ("a".to_string(), vec![1, 3]),
                ("b".to_string(), vec![2, 5]),
                ("c".to_string(), vec![4]),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_lane_within_bounds(key in ".{0,32}", lanes in 1usize..512) {
            prop_assert!(lane_of(&key, lanes) < lanes);
        }
    }

    #[tokio::test]
    async fn test_key_is_handled_by_one_lane_in_order() {
        let recorder = Arc::new(Recorder::default());
        let batcher = Batcher::start(config(8, 1000), recorder.clone());

        for i in 0..50u32 {
            batcher.put(format!("conv_{}", i % 5), i).unwrap();
            if i % 10 == 9 {
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        }
        batcher.shutdown().await;

        let seen = recorder.seen.lock();
        for k in 0..5u32 {
            let key = format!("conv_{k}");
            let slices: Vec<_> = seen.iter().filter(|(_, sk, _)| *sk == key).collect();
            assert!(slices.iter().all(|(lane, _, _)| *lane == lane_of(&key, 8)));
            let items: Vec<u32> = slices.iter().flat_map(|(_, _, items)| items.clone()).collect();
            let expected: Vec<u32> = (0..50).filter(|i| i % 5 == k).collect();
            assert_eq!(items, expected);
        }
    }

    #[tokio::test]
    async fn test_pages_are_bounded() {
        let recorder = Arc::new(Recorder::default());
        let batcher = Batcher::start(config(2, 2), recorder.clone());
        for i in 0..5u32 {
            batcher.put("conv", i).unwrap();
        }
        batcher.shutdown().await;

        let seen = recorder.seen.lock();
        let sizes: Vec<usize> = seen.iter().map(|(_, _, items)| items.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batcher.stats().pages, 3);
        assert_eq!(batcher.stats().records, 5);
    }

    #[tokio::test]
    async fn test_put_after_shutdown_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let batcher = Batcher::start(config(2, 10), recorder.clone());
        batcher.put("conv", 1).unwrap();
        batcher.shutdown().await;

        assert!(matches!(batcher.put("conv", 2), Err(MsglineError::Shutdown)));
        assert_eq!(recorder.seen.lock().len(), 1);
        assert_eq!(batcher.stats().pending, 0);
    }
}
