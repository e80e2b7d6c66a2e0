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

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use msgline_core::doc::parse_doc_id;
use msgline_core::{MsgDoc, MsgSlot, MsglineError, Result};
use parking_lot::RwLock;

use super::DocStore;

/// Documents grouped per conversation, ordered by shard index.
#[derive(Debug, Default)]
pub struct MemoryDocStore {
    conversations: RwLock<HashMap<String, BTreeMap<i64, MsgDoc>>>,
    failing_writes: AtomicU32,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn doc_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .get(conversation_id)
            .map_or(0, BTreeMap::len)
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MsglineError::Store("injected write failure".into()));
        }
        Ok(())
    }

    fn locate(doc_id: &str) -> Result<(&str, i64)> {
        parse_doc_id(doc_id)
            .ok_or_else(|| MsglineError::InvalidArgument(format!("malformed doc id {doc_id}")))
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn find_one(&self, doc_id: &str) -> Result<Option<MsgDoc>> {
        let (conversation_id, index) = Self::locate(doc_id)?;
        Ok(self
            .conversations
            .read()
            .get(conversation_id)
            .and_then(|docs| docs.get(&index))
            .cloned())
    }

    async fn create(&self, doc: MsgDoc) -> Result<()> {
        self.check_write()?;
        let (conversation_id, index) = Self::locate(&doc.doc_id)?;
        let mut conversations = self.conversations.write();
        let docs = conversations.entry(conversation_id.to_string()).or_default();
        if docs.contains_key(&index) {
            return Err(MsglineError::DocExists(doc.doc_id));
        }
        docs.insert(index, doc);
        Ok(())
    }

    async fn write_slots(
        &self,
        doc_id: &str,
        start_index: usize,
        slots: Vec<MsgSlot>,
    ) -> Result<bool> {
        self.check_write()?;
        let (conversation_id, index) = Self::locate(doc_id)?;
        let mut conversations = self.conversations.write();
        let Some(doc) = conversations
            .get_mut(conversation_id)
            .and_then(|docs| docs.get_mut(&index))
        else {
            return Ok(false);
        };

        if doc.msgs.len() < start_index {
            doc.msgs.resize(start_index, MsgSlot::default());
        }
        for (offset, slot) in slots.into_iter().enumerate() {
            let position = start_index + offset;
            if position < doc.msgs.len() {
                doc.msgs[position] = slot;
            } else {
                doc.msgs.push(slot);
            }
        }
        Ok(true)
    }

    async fn update_slots(&self, doc_id: &str, updates: Vec<(usize, MsgSlot)>) -> Result<bool> {
        self.check_write()?;
        let (conversation_id, index) = Self::locate(doc_id)?;
        let mut conversations = self.conversations.write();
        let Some(doc) = conversations
            .get_mut(conversation_id)
            .and_then(|docs| docs.get_mut(&index))
        else {
            return Ok(false);
        };

        for (position, slot) in updates {
            if let Some(existing) = doc.msgs.get_mut(position) {
                *existing = slot;
            }
        }
        Ok(true)
    }

    async fn delete_docs(&self, doc_ids: &[String]) -> Result<u64> {
        self.check_write()?;
        let mut conversations = self.conversations.write();
        let mut deleted = 0;
        for doc_id in doc_ids {
            let (conversation_id, index) = Self::locate(doc_id)?;
            if let Some(docs) = conversations.get_mut(conversation_id) {
                if docs.remove(&index).is_some() {
                    deleted += 1;
                }
                if docs.is_empty() {
                    conversations.remove(conversation_id);
                }
            }
        }
        Ok(deleted)
    }

    async fn find_doc_by_order(
        &self,
        conversation_id: &str,
        skip: usize,
        ascending: bool,
    ) -> Result<Option<MsgDoc>> {
        let conversations = self.conversations.read();
        let Some(docs) = conversations.get(conversation_id) else {
            return Ok(None);
        };
        let doc = if ascending {
            docs.values().nth(skip)
        } else {
            docs.values().rev().nth(skip)
        };
        Ok(doc.cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.conversations.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgline_core::MsgData;

    fn slot(seq: i64) -> MsgSlot {
        MsgSlot::new(MsgData {
            seq,
            content: format!("m{seq}"),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = MemoryDocStore::new();
        store.create(MsgDoc::new("c:0")).await.unwrap();
        let err = store.create(MsgDoc::new("c:0")).await.unwrap_err();
        assert!(matches!(err, MsglineError::DocExists(_)));
    }

    #[tokio::test]
    async fn test_write_slots_overwrites_and_appends() {
        let store = MemoryDocStore::new();
        assert!(!store.write_slots("c:0", 0, vec![slot(1)]).await.unwrap());

        store.create(MsgDoc::new("c:0")).await.unwrap();
        assert!(store
            .write_slots("c:0", 0, vec![slot(1), slot(2)])
            .await
            .unwrap());
        // Redelivery of the same batch lands on the same positions.
        store
            .write_slots("c:0", 0, vec![slot(1), slot(2)])
            .await
            .unwrap();
        store.write_slots("c:0", 3, vec![slot(4)]).await.unwrap();

        let doc = store.find_one("c:0").await.unwrap().unwrap();
        assert_eq!(doc.msgs.len(), 4);
        assert!(doc.msgs[2].is_empty());
        assert_eq!(doc.msgs[3].msg.as_ref().unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_find_doc_by_order_is_numeric() {
        let store = MemoryDocStore::new();
        for index in [10, 2, 1] {
            store
                .create(MsgDoc::new(format!("c:{index}")))
                .await
                .unwrap();
        }

        let oldest = store.find_doc_by_order("c", 0, true).await.unwrap().unwrap();
        let second = store.find_doc_by_order("c", 1, true).await.unwrap().unwrap();
        let newest = store.find_doc_by_order("c", 0, false).await.unwrap().unwrap();
        assert_eq!(oldest.doc_id, "c:1");
        assert_eq!(second.doc_id, "c:2");
        assert_eq!(newest.doc_id, "c:10");
        assert!(store.find_doc_by_order("c", 3, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_docs_drops_empty_conversation() {
        let store = MemoryDocStore::new();
        store.create(MsgDoc::new("c:0")).await.unwrap();
        store.create(MsgDoc::new("d:0")).await.unwrap();

        let deleted = store
            .delete_docs(&["c:0".to_string(), "c:1".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list_conversations().await.unwrap(), vec!["d".to_string()]);
    }
}
