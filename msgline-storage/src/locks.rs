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

//! Striped per-conversation locks
//!
//! Durable writes and retention compaction for one conversation must not
//! interleave. Conversations hash onto a fixed set of stripes so the lock
//! table never grows.

use std::hash::Hasher;

use tokio::sync::{Mutex, MutexGuard};
use twox_hash::XxHash64;

/// Number of stripes (power of 2 for fast modulo)
pub const NUM_STRIPES: usize = 64;

#[derive(Debug)]
pub struct ConversationLocks {
    stripes: Vec<Mutex<()>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::with_stripes(NUM_STRIPES)
    }

    pub fn with_stripes(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe_of(&self, conversation_id: &str) -> usize {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(conversation_id.as_bytes());
        (hasher.finish() as usize) & (self.stripes.len() - 1)
    }

    pub async fn lock(&self, conversation_id: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(conversation_id)].lock().await
    }
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_stripe_is_stable() {
        let locks = ConversationLocks::with_stripes(10);
        assert_eq!(locks.stripes.len(), 16);
        assert_eq!(locks.stripe_of("sg_1"), locks.stripe_of("sg_1"));
        assert!(locks.stripe_of("sg_1") < 16);
    }

    #[tokio::test]
    async fn test_same_conversation_is_serialized() {
        let locks = Arc::new(ConversationLocks::new());
        let guard = locks.lock("c").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("c").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
