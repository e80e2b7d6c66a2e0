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

//! Document store capability for shard documents.

pub mod memory;

use async_trait::async_trait;
use msgline_core::{MsgDoc, MsgSlot, Result};

pub use memory::MemoryDocStore;

#[async_trait]
pub trait DocStore: Send + Sync {
    async fn find_one(&self, doc_id: &str) -> Result<Option<MsgDoc>>;

    /// Fails with `MsglineError::DocExists` if the ID is taken.
    async fn create(&self, doc: MsgDoc) -> Result<()>;

    /// Writes `slots` at positions `start_index..`, overwriting what is
    /// there and appending past the end. Gaps before `start_index` are
    /// padded with empty slots. Returns `false` when the doc does not exist.
    async fn write_slots(&self, doc_id: &str, start_index: usize, slots: Vec<MsgSlot>)
        -> Result<bool>;

    /// Replaces individual slots by index. Indexes past the end are ignored.
    /// Returns `false` when the doc does not exist.
    async fn update_slots(&self, doc_id: &str, updates: Vec<(usize, MsgSlot)>) -> Result<bool>;

    async fn delete_docs(&self, doc_ids: &[String]) -> Result<u64>;

    /// The `skip`-th document of a conversation ordered by numeric shard
    /// index, oldest first when `ascending`.
    async fn find_doc_by_order(
        &self,
        conversation_id: &str,
        skip: usize,
        ascending: bool,
    ) -> Result<Option<MsgDoc>>;

    async fn list_conversations(&self) -> Result<Vec<String>>;
}
