use std::collections::HashMap;

use shared::{
    domain::{ConversationScope, PeerKey},
    protocol::UnreadCount,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Pending unread count per conversation.
#[derive(Debug, Default)]
pub struct UnreadLedger {
    counts: Mutex<HashMap<ConversationScope, u32>>,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a message unless it belongs to the active scope or was sent by
    /// self. Returns the new count when it changed.
    pub async fn on_inbound_message(
        &self,
        scope: &ConversationScope,
        sender: &PeerKey,
        self_key: &PeerKey,
        active: Option<&ConversationScope>,
    ) -> Option<u32> {
        if !scope.is_addressable() || active == Some(scope) {
            return None;
        }
        if !self_key.is_empty() && sender == self_key {
            return None;
        }
        let mut guard = self.counts.lock().await;
        let count = guard.entry(scope.clone()).or_insert(0);
        *count = count.saturating_add(1);
        Some(*count)
    }

    pub async fn clear(&self, scope: &ConversationScope) -> u32 {
        self.counts.lock().await.remove(scope).unwrap_or(0)
    }

    /// Replaces every counter with the authoritative list. Scopes absent from
    /// the list read as zero afterwards. Returns `true` if anything changed.
    pub async fn reconcile(&self, authoritative: Vec<UnreadCount>) -> bool {
        let mut next = HashMap::with_capacity(authoritative.len());
        for entry in authoritative {
            if entry.count == 0 || !entry.scope.is_addressable() {
                continue;
            }
            *next.entry(entry.scope).or_insert(0) += entry.count;
        }
        let mut guard = self.counts.lock().await;
        let changed = *guard != next;
        if changed {
            debug!(scopes = next.len(), "unread: ledger corrected from collaborator");
        }
        *guard = next;
        changed
    }

    pub async fn count(&self, scope: &ConversationScope) -> u32 {
        self.counts.lock().await.get(scope).copied().unwrap_or(0)
    }

    pub async fn total(&self) -> u32 {
        self.counts
            .lock()
            .await
            .values()
            .fold(0u32, |acc, count| acc.saturating_add(*count))
    }

    pub async fn snapshot(&self) -> Vec<UnreadCount> {
        let guard = self.counts.lock().await;
        let mut out: Vec<UnreadCount> = guard
            .iter()
            .map(|(scope, count)| UnreadCount {
                scope: scope.clone(),
                count: *count,
            })
            .collect();
        out.sort_by_key(|entry| entry.scope.to_string());
        out
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
