//! # Peer registry
//!
//! Concurrent map of peer id → [`Peer`] plus the ban list consulted
//! during handshake admission. Writers take the exclusive side of the
//! lock, readers the shared side; snapshots are cheap because peers are
//! clone-by-handle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::transport::Peer;

#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    bans: Arc<RwLock<HashSet<String>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, id: String, peer: Peer) {
        self.peers.write().await.insert(id, peer);
    }

    pub async fn get(&self, id: &str) -> Option<Peer> {
        self.peers.read().await.get(id).cloned()
    }

    /// Remove the entry for `id`, but only while it still holds the given
    /// connection. A stale pump must not evict the peer that replaced it.
    pub async fn remove_if_connection(&self, id: &str, connection_id: usize) -> bool {
        let mut peers = self.peers.write().await;
        if peers
            .get(id)
            .is_some_and(|p| p.connection_id() == connection_id)
        {
            peers.remove(id);
            debug!(peer = %&id[..id.len().min(16)], "removed peer from registry");
            return true;
        }
        false
    }

    pub async fn ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<(String, Peer)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, peer)| (id.clone(), peer.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn ban(&self, id: String) {
        self.bans.write().await.insert(id);
    }

    pub async fn unban(&self, id: &str) {
        self.bans.write().await.remove(id);
    }

    pub async fn is_banned(&self, id: &str) -> bool {
        self.bans.read().await.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ban_list_round_trip() {
        let registry = PeerRegistry::new();
        let id = "ab".repeat(32);

        assert!(!registry.is_banned(&id).await);
        registry.ban(id.clone()).await;
        assert!(registry.is_banned(&id).await);

        // Banning twice is idempotent.
        registry.ban(id.clone()).await;
        registry.unban(&id).await;
        assert!(!registry.is_banned(&id).await);
    }

    #[tokio::test]
    async fn empty_registry_has_no_peers() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty().await);
        assert_eq!(registry.len().await, 0);
        assert!(registry.get("missing").await.is_none());
        assert!(registry.ids().await.is_empty());
    }
}
