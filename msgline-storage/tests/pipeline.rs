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

//! Allocation, persistence, reads and retention over the in-memory backends.

use std::time::Duration;

use msgline_core::metrics::{self, InMemoryMetrics};
use msgline_core::{now_ms, MsgData};
use msgline_storage::{Storage, StorageOptions};
use std::sync::Arc;

fn storage(capacity: usize) -> (Storage, Arc<InMemoryMetrics>) {
    let recorder = Arc::new(InMemoryMetrics::new());
    let options = StorageOptions {
        shard_capacity: capacity,
        msg_cache_ttl: Duration::from_secs(300),
        ..Default::default()
    };
    (Storage::in_memory(options, recorder.clone()), recorder)
}

fn outgoing(sender: &str, n: usize, send_time: i64) -> Vec<MsgData> {
    (0..n)
        .map(|i| MsgData {
            send_id: sender.to_string(),
            client_msg_id: format!("{sender}-{i}-{send_time}"),
            content: format!("{sender} says {i}"),
            send_time,
            ..Default::default()
        })
        .collect()
}

/// Runs one batch through the same steps ingestion and the store consumer do.
async fn ingest(storage: &Storage, conversation_id: &str, mut msgs: Vec<MsgData>) -> Vec<MsgData> {
    let outcome = storage
        .seqs
        .batch_insert_chat2cache(conversation_id, &mut msgs)
        .await
        .unwrap();
    storage
        .log
        .batch_insert_chat2db(conversation_id, &msgs, outcome.last_seq)
        .await
        .unwrap();
    msgs
}

#[tokio::test]
async fn written_messages_read_back_identical() {
    let (storage, _) = storage(8);
    let now = now_ms();
    let mut written = Vec::new();
    for batch in [3, 7, 8, 1] {
        written.extend(ingest(&storage, "sg_team", outgoing("alice", batch, now)).await);
    }

    let seqs: Vec<i64> = written.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, (1..=19).collect::<Vec<_>>());

    // Drop the cache copies so the store answers.
    storage.msg_cache.purge_conversation("sg_team").await.unwrap();
    let pulled = storage.reads.get_msg_by_seqs("sg_team", &seqs).await.unwrap();
    assert_eq!(pulled.max_seq, 19);
    assert_eq!(pulled.msgs, written);
}

#[tokio::test]
async fn retention_turns_expired_messages_into_placeholders() {
    let (storage, recorder) = storage(5);
    let old = now_ms() - 30 * 86_400_000;
    ingest(&storage, "si_a_b", outgoing("a", 5, old)).await;
    ingest(&storage, "si_a_b", outgoing("b", 2, old)).await;
    ingest(&storage, "si_a_b", outgoing("a", 2, now_ms())).await;

    let min_seq = storage.retention.compact("si_a_b", 7 * 86_400).await.unwrap();
    assert_eq!(min_seq, 8);
    assert_eq!(storage.seqs.get_min_seq("si_a_b").await.unwrap(), 8);

    let pulled = storage
        .reads
        .get_msg_by_seqs("si_a_b", &[1, 6, 7, 8, 9])
        .await
        .unwrap();
    assert!(pulled.msgs[..3].iter().all(MsgData::is_placeholder));
    assert_eq!(pulled.msgs[3].content, "a says 0");
    assert_eq!(pulled.msgs[4].content, "a says 1");
    assert_eq!(recorder.counter(metrics::RETENTION_DOCS_DELETED), 1);

    let range = storage
        .reads
        .get_msg_by_seqs_range("si_a_b", 1, 9, 10)
        .await
        .unwrap();
    let seqs: Vec<i64> = range.msgs.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![8, 9]);
}

#[tokio::test]
async fn tombstoned_seq_reads_as_placeholder() {
    let (storage, _) = storage(10);
    ingest(&storage, "sg_1", outgoing("u", 4, now_ms())).await;

    storage
        .log
        .delete_msgs_physical_by_seqs("sg_1", &[2])
        .await
        .unwrap();

    let pulled = storage.reads.get_msg_by_seqs("sg_1", &[2, 3]).await.unwrap();
    assert!(pulled.msgs[0].is_placeholder());
    assert_eq!(pulled.msgs[0].seq, 2);
    assert!(pulled.msgs[0].content.is_empty());
    assert_eq!(pulled.msgs[1].content, "u says 2");
}

#[tokio::test]
async fn drift_is_zero_after_clean_ingest() {
    let (storage, _) = storage(10);
    ingest(&storage, "sg_2", outgoing("u", 6, now_ms())).await;
    assert_eq!(
        storage.retention.check_max_seq_with_store("sg_2").await.unwrap(),
        0
    );
}
