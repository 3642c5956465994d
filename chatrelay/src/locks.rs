//! Per-conversation serialization.
//!
//! A chat turn reads a conversation, appends, trims and writes it back, then
//! appends the reply. Holding the conversation's lock for the whole turn keeps
//! two turns on the same id from interleaving. Turns on different ids run
//! concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<i64, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct ConversationLocks {
    map: Arc<LockMap>,
}

/// Held for the duration of a turn. The map entry is dropped once no other
/// turn is holding or waiting on it.
pub struct ConversationGuard {
    id: i64,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<LockMap>,
}

impl ConversationLocks {
    pub async fn lock(&self, conversation_id: i64) -> ConversationGuard {
        let mutex = self.map.entry(conversation_id).or_default().clone();
        let guard = mutex.lock_owned().await;
        ConversationGuard {
            id: conversation_id,
            guard: Some(guard),
            map: self.map.clone(),
        }
    }

    /// Number of conversations with a live lock entry.
    #[cfg(test)]
    fn active(&self) -> usize {
        self.map.len()
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.map
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
