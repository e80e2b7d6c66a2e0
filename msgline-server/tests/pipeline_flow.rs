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

//! End-to-end flow through the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use msgline_core::message::content_type;
use msgline_core::metrics::{self, InMemoryMetrics};
use msgline_core::wire::{self, PushMsgEvent};
use msgline_core::{MsgData, MsgOptions};
use msgline_server::broker::{BrokerClient, MemoryBroker};
use msgline_server::config::ServerConfig;
use msgline_server::Pipeline;
use msgline_storage::Storage;

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.ingest.lanes = 4;
    config.ingest.flush_interval_ms = 10;
    config.storage.shard_capacity = 3;
    config.retention.enabled = false;
    config
}

fn start(config: &ServerConfig) -> (Pipeline, Storage, Arc<MemoryBroker>, Arc<InMemoryMetrics>) {
    let recorder = Arc::new(InMemoryMetrics::new());
    let storage = Storage::in_memory(config.storage_options(), recorder.clone());
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = Pipeline::start(config, storage.clone(), broker.clone(), recorder.clone());
    (pipeline, storage, broker, recorder)
}

fn text(sender: &str, content: &str) -> MsgData {
    MsgData {
        send_id: sender.to_string(),
        client_msg_id: format!("cid-{content}"),
        content_type: content_type::TEXT,
        content: content.to_string(),
        send_time: msgline_core::now_ms(),
        ..Default::default()
    }
}

async fn send(broker: &MemoryBroker, key: &str, msg: &MsgData) {
    broker
        .publish("to_transfer", key, wire::encode(msg).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_messages_flow_to_push_and_durable_log() {
    let config = test_config();
    let (pipeline, storage, broker, recorder) = start(&config);
    let mut push = broker.subscribe("to_push");

    for i in 1..=7 {
        send(&broker, "sg_1", &text("u1", &format!("m{i}"))).await;
        if i == 4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }
    send(&broker, "sg_2", &text("u2", "other")).await;
    pipeline.shutdown().await;

    let mut pushed = Vec::new();
    while let Ok(record) = push.try_recv() {
        let event: PushMsgEvent = wire::decode(&record.value).unwrap();
        if event.conversation_id == "sg_1" {
            pushed.push(event.msg.seq);
        }
    }
    assert_eq!(pushed, (1..=7).collect::<Vec<_>>());

    let pulled = storage
        .reads
        .get_msg_by_seqs("sg_1", &(1..=7).collect::<Vec<_>>())
        .await
        .unwrap();
    assert_eq!(pulled.max_seq, 7);
    let contents: Vec<_> = pulled.msgs.iter().map(|m| m.content.clone()).collect();
    assert_eq!(contents, (1..=7).map(|i| format!("m{i}")).collect::<Vec<_>>());

    let newest = storage.log.get_newest_msg("sg_1").await.unwrap().unwrap();
    assert_eq!(newest.seq, 7);
    assert!(storage.log.find_one_by_doc_id("sg_1:2").await.unwrap().is_some());
    assert_eq!(storage.seqs.get_max_seq("sg_2").await.unwrap(), 1);
    assert_eq!(recorder.counter(metrics::NEW_CONVERSATIONS), 2);
}

#[tokio::test]
async fn test_typing_indicator_is_pushed_but_not_stored() {
    let config = test_config();
    let (pipeline, storage, broker, _recorder) = start(&config);
    let mut push = broker.subscribe("to_push");

    let typing = MsgData {
        content_type: content_type::TYPING,
        options: MsgOptions {
            is_history: false,
            ..Default::default()
        },
        ..text("u1", "typing")
    };
    send(&broker, "si_u1_u2", &typing).await;
    pipeline.shutdown().await;

    let record = push.try_recv().unwrap();
    let event: PushMsgEvent = wire::decode(&record.value).unwrap();
    assert_eq!(event.msg.content_type, content_type::TYPING);
    assert_eq!(storage.seqs.get_max_seq("si_u1_u2").await.unwrap(), 0);
    assert!(storage.log.get_newest_msg("si_u1_u2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_retention_after_ingest_leaves_placeholders() {
    let config = test_config();
    let (pipeline, storage, broker, _recorder) = start(&config);

    for i in 1..=4 {
        let old = MsgData {
            send_time: 1_000,
            ..text("u1", &format!("old{i}"))
        };
        send(&broker, "sg_1", &old).await;
    }
    pipeline.shutdown().await;

    let min_seq = storage.retention.compact("sg_1", 60).await.unwrap();
    assert_eq!(min_seq, 5);

    let pulled = storage.reads.get_msg_by_seqs("sg_1", &[1, 2, 3, 4]).await.unwrap();
    assert_eq!(pulled.msgs.len(), 4);
    assert!(pulled.msgs.iter().all(|m| m.content.is_empty()));
}

#[tokio::test]
async fn test_notification_with_chat_copy_lands_in_both_streams() {
    let config = test_config();
    let (pipeline, storage, broker, _recorder) = start(&config);

    let joined = MsgData {
        options: MsgOptions {
            is_notification: true,
            is_send_msg: true,
            ..Default::default()
        },
        ..text("u1", "u3 joined")
    };
    send(&broker, "sg_1", &joined).await;
    pipeline.shutdown().await;

    assert_eq!(storage.seqs.get_max_seq("sg_1").await.unwrap(), 1);
    assert_eq!(storage.seqs.get_max_seq("n_1").await.unwrap(), 1);

    let chat = storage.log.get_newest_msg("sg_1").await.unwrap().unwrap();
    assert!(!chat.options.is_notification);
    assert!(chat.options.is_offline_push);
    let notice = storage.log.get_newest_msg("n_1").await.unwrap().unwrap();
    assert!(notice.options.is_notification);
    assert!(!notice.options.is_offline_push);
    assert_eq!(notice.content, "u3 joined");
}
