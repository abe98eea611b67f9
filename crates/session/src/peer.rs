use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Identity of a peer: its display name, unique within a service namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self(display_name.into())
    }

    pub fn display_name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PeerId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// Seen by a browse operation, not connected.
    Discovered,
    Connecting,
    Connected,
    /// Terminal. A peer reaching this state is removed from the table.
    Disconnected,
}

impl PeerState {
    /// Whether a peer currently in `self` may move to `next`.
    ///
    /// Connected peers never go back to `Discovered`, and nothing leaves
    /// `Disconnected`.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Discovered, Connected)
                | (Discovered, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }

    /// States a previously unknown peer may enter.
    pub fn can_enter_from_unknown(self) -> bool {
        !matches!(self, PeerState::Disconnected)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub last_seen: Instant,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, state: PeerState) -> Self {
        Self {
            peer_id,
            state,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Peers known to a session, keyed by identity.
///
/// Clones share the same table. Only the owning session mutates it;
/// everything else reads snapshots.
pub struct PeerTable {
    peers: Arc<RwLock<HashMap<PeerId, PeerInfo>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Apply a state change. Returns `true` if the table changed.
    ///
    /// Invalid transitions are ignored. Moving to `Disconnected` removes
    /// the peer.
    pub(crate) async fn apply(&self, peer_id: &PeerId, next: PeerState) -> bool {
        let mut peers = self.peers.write().await;

        match peers.get_mut(peer_id) {
            Some(info) => {
                if !info.state.can_transition_to(next) {
                    return false;
                }
                if next == PeerState::Disconnected {
                    peers.remove(peer_id);
                } else {
                    info.state = next;
                    info.touch();
                }
                true
            }
            None => {
                if !next.can_enter_from_unknown() {
                    return false;
                }
                peers.insert(peer_id.clone(), PeerInfo::new(peer_id.clone(), next));
                true
            }
        }
    }

    /// Drop a peer that was only discovered, e.g. when a browse ends or the
    /// advertisement disappears. Connecting and connected peers are kept.
    pub(crate) async fn forget_discovered(&self, peer_id: &PeerId) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(info) if info.state == PeerState::Discovered => {
                peers.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn clear(&self) -> Vec<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.drain().map(|(_, info)| info).collect()
    }

    pub(crate) async fn touch(&self, peer_id: &PeerId) {
        let mut peers = self.peers.write().await;
        if let Some(info) = peers.get_mut(peer_id) {
            info.touch();
        }
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.peers.read().await.get(peer_id).map(|info| info.state)
    }

    pub async fn list(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut list: Vec<PeerInfo> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        list
    }

    pub async fn connected(&self) -> Vec<PeerId> {
        let peers = self.peers.read().await;
        let mut connected: Vec<PeerId> = peers
            .values()
            .filter(|info| info.state.is_connected())
            .map(|info| info.peer_id.clone())
            .collect();
        connected.sort();
        connected
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PeerTable {
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use PeerState::*;
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Connecting.can_transition_to(Disconnected));

        assert!(!Connected.can_transition_to(Discovered));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Discovered));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let table = PeerTable::new();
        let bob = PeerId::new("bob");

        assert!(table.apply(&bob, PeerState::Discovered).await);
        assert!(table.apply(&bob, PeerState::Connecting).await);
        assert!(table.apply(&bob, PeerState::Connected).await);
        assert_eq!(table.connected().await, vec![bob.clone()]);

        assert!(table.apply(&bob, PeerState::Disconnected).await);
        assert!(table.get(&bob).await.is_none());
        assert!(table.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer_disconnect_is_noop() {
        let table = PeerTable::new();
        assert!(!table.apply(&PeerId::new("ghost"), PeerState::Disconnected).await);
        assert!(table.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_connected_peer_not_rediscovered() {
        let table = PeerTable::new();
        let carol = PeerId::new("carol");

        table.apply(&carol, PeerState::Connected).await;
        assert!(!table.apply(&carol, PeerState::Discovered).await);
        assert_eq!(table.state(&carol).await, Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn test_forget_only_discovered() {
        let table = PeerTable::new();
        let a = PeerId::new("a");
        let b = PeerId::new("b");

        table.apply(&a, PeerState::Discovered).await;
        table.apply(&b, PeerState::Connected).await;

        assert!(table.forget_discovered(&a).await);
        assert!(!table.forget_discovered(&b).await);
        assert_eq!(table.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_table() {
        let table = PeerTable::new();
        let view = table.clone();
        table.apply(&PeerId::new("dave"), PeerState::Discovered).await;
        assert_eq!(view.list().await.len(), 1);
    }
}
