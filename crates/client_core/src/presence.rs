use std::collections::HashMap;

use shared::domain::{PeerKey, PresenceStatus};
use tokio::sync::RwLock;

/// Last-write-wins online flag per peer. Shared across scopes.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    peers: RwLock<HashMap<PeerKey, bool>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the prior state. Returns `true` when the stored value changed.
    pub async fn set_status(&self, peer: PeerKey, status: PresenceStatus) -> bool {
        if peer.is_empty() {
            return false;
        }
        let online = status.is_online();
        let mut guard = self.peers.write().await;
        guard.insert(peer, online) != Some(online)
    }

    pub async fn is_online(&self, peer: &PeerKey) -> bool {
        self.peers.read().await.get(peer).copied().unwrap_or(false)
    }

    pub async fn status(&self, peer: &PeerKey) -> Option<PresenceStatus> {
        self.peers.read().await.get(peer).map(|online| {
            if *online {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            }
        })
    }

    pub async fn online_peers(&self) -> Vec<PeerKey> {
        let guard = self.peers.read().await;
        let mut peers: Vec<PeerKey> = guard
            .iter()
            .filter(|(_, online)| **online)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}
