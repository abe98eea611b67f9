//! In-process transport.
//!
//! Every [`MemoryTransport`] joined to the same [`MemoryNetwork`] can see
//! the others. Used by tests and by single-process demos. Faults can be
//! injected per peer to exercise failure paths.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::peer::PeerId;
use crate::transport::{Transport, TransportEvent, TransportEvents};

struct Node {
    events: mpsc::UnboundedSender<TransportEvent>,
    advertising: Option<String>,
    browsing: Option<String>,
    links: HashSet<PeerId>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, Node>,
    failing_sends: HashSet<PeerId>,
    refusing: HashSet<PeerId>,
}

impl NetworkState {
    fn notify(&self, to: &PeerId, event: TransportEvent) {
        if let Some(node) = self.nodes.get(to) {
            let _ = node.events.send(event);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new participant. Fails if the name is already taken.
    pub fn join(&self, display_name: &str) -> Result<(MemoryTransport, TransportEvents)> {
        let peer_id = PeerId::new(display_name);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        if state.nodes.contains_key(&peer_id) {
            return Err(SessionError::InvalidDisplayName(format!(
                "'{}' already joined",
                display_name
            )));
        }
        state.nodes.insert(
            peer_id.clone(),
            Node {
                events: tx,
                advertising: None,
                browsing: None,
                links: HashSet::new(),
            },
        );

        Ok((
            MemoryTransport {
                local_peer: peer_id,
                network: self.clone(),
            },
            rx,
        ))
    }

    /// Every send addressed to `peer` fails until restored.
    pub fn fail_sends_to(&self, peer: &PeerId) {
        self.state.lock().failing_sends.insert(peer.clone());
    }

    /// Every connection attempt to `peer` fails until restored.
    pub fn refuse_connections(&self, peer: &PeerId) {
        self.state.lock().refusing.insert(peer.clone());
    }

    pub fn restore(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.failing_sends.remove(peer);
        state.refusing.remove(peer);
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state
            .lock()
            .nodes
            .get(a)
            .map(|node| node.links.contains(b))
            .unwrap_or(false)
    }
}

pub struct MemoryTransport {
    local_peer: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    fn unlink(state: &mut NetworkState, a: &PeerId, b: &PeerId) -> bool {
        let removed = state
            .nodes
            .get_mut(a)
            .map(|node| node.links.remove(b))
            .unwrap_or(false);
        if let Some(node) = state.nodes.get_mut(b) {
            node.links.remove(a);
        }
        if removed {
            state.notify(a, TransportEvent::Disconnected(b.clone()));
            state.notify(b, TransportEvent::Disconnected(a.clone()));
        }
        removed
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    async fn advertise(&self, service_type: &str) -> Result<()> {
        let mut state = self.network.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.local_peer) {
            node.advertising = Some(service_type.to_string());
        }

        let browsers: Vec<PeerId> = state
            .nodes
            .iter()
            .filter(|(id, node)| {
                **id != self.local_peer && node.browsing.as_deref() == Some(service_type)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for browser in browsers {
            state.notify(&browser, TransportEvent::Discovered(self.local_peer.clone()));
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        let service = match state.nodes.get_mut(&self.local_peer) {
            Some(node) => node.advertising.take(),
            None => None,
        };

        if let Some(service) = service {
            let browsers: Vec<PeerId> = state
                .nodes
                .iter()
                .filter(|(id, node)| {
                    **id != self.local_peer && node.browsing.as_deref() == Some(service.as_str())
                })
                .map(|(id, _)| id.clone())
                .collect();
            for browser in browsers {
                state.notify(&browser, TransportEvent::Lost(self.local_peer.clone()));
            }
        }
        Ok(())
    }

    async fn browse(&self, service_type: &str) -> Result<()> {
        let mut state = self.network.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.local_peer) {
            node.browsing = Some(service_type.to_string());
        }

        let advertisers: Vec<PeerId> = state
            .nodes
            .iter()
            .filter(|(id, node)| {
                **id != self.local_peer && node.advertising.as_deref() == Some(service_type)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for advertiser in advertisers {
            state.notify(&self.local_peer, TransportEvent::Discovered(advertiser));
        }
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.local_peer) {
            node.browsing = None;
        }
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<()> {
        let mut state = self.network.state.lock();

        if !state.nodes.contains_key(peer) || *peer == self.local_peer {
            return Err(SessionError::PeerNotFound(peer.to_string()));
        }
        if state.refusing.contains(peer) {
            return Err(SessionError::ConnectionFailed(format!(
                "{} declined the invitation",
                peer
            )));
        }

        let newly_linked = match state.nodes.get_mut(&self.local_peer) {
            Some(node) => node.links.insert(peer.clone()),
            None => return Err(SessionError::ChannelClosed),
        };
        if let Some(node) = state.nodes.get_mut(peer) {
            node.links.insert(self.local_peer.clone());
        }

        if newly_linked {
            debug!("Memory link {} <-> {}", self.local_peer, peer);
            state.notify(&self.local_peer, TransportEvent::Connected(peer.clone()));
            state.notify(peer, TransportEvent::Connected(self.local_peer.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        let mut state = self.network.state.lock();
        Self::unlink(&mut state, &self.local_peer, peer);
        Ok(())
    }

    async fn send(&self, peer: &PeerId, payload: Bytes) -> Result<()> {
        let state = self.network.state.lock();

        let linked = state
            .nodes
            .get(&self.local_peer)
            .map(|node| node.links.contains(peer))
            .unwrap_or(false);
        if !linked {
            return Err(SessionError::PeerNotFound(peer.to_string()));
        }
        if state.failing_sends.contains(peer) {
            return Err(SessionError::Transport(format!("delivery to {} failed", peer)));
        }

        state.notify(
            peer,
            TransportEvent::Received {
                peer: self.local_peer.clone(),
                payload,
            },
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop_advertising().await?;
        self.stop_browsing().await?;

        let mut state = self.network.state.lock();
        let links: Vec<PeerId> = state
            .nodes
            .get(&self.local_peer)
            .map(|node| node.links.iter().cloned().collect())
            .unwrap_or_default();
        for peer in links {
            Self::unlink(&mut state, &self.local_peer, &peer);
        }
        state.nodes.remove(&self.local_peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_browse_sees_existing_advertiser() {
        let network = MemoryNetwork::new();
        let (host, _host_rx) = network.join("host").unwrap();
        let (guest, mut guest_rx) = network.join("guest").unwrap();

        host.advertise("photos").await.unwrap();
        guest.browse("photos").await.unwrap();

        match guest_rx.recv().await.unwrap() {
            TransportEvent::Discovered(peer) => assert_eq!(peer.display_name(), "host"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_service_not_discovered() {
        let network = MemoryNetwork::new();
        let (host, _host_rx) = network.join("host").unwrap();
        let (guest, mut guest_rx) = network.join("guest").unwrap();

        guest.browse("photos").await.unwrap();
        host.advertise("music").await.unwrap();

        assert!(guest_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.join("a").unwrap();
        let (_b, mut b_rx) = network.join("b").unwrap();

        a.connect(&PeerId::new("b")).await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::Connected(_))));
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::Connected(_))));

        a.send(&PeerId::new("b"), Bytes::from_static(b"hi")).await.unwrap();
        match b_rx.recv().await.unwrap() {
            TransportEvent::Received { peer, payload } => {
                assert_eq!(peer.display_name(), "a");
                assert_eq!(&payload[..], b"hi");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_emits_nothing() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.join("a").unwrap();
        let (_b, _b_rx) = network.join("b").unwrap();
        network.refuse_connections(&PeerId::new("b"));

        assert!(a.connect(&PeerId::new("b")).await.is_err());
        assert!(a_rx.try_recv().is_err());
        assert!(!network.is_linked(&PeerId::new("a"), &PeerId::new("b")));
    }

    #[tokio::test]
    async fn test_send_requires_link() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.join("a").unwrap();
        let (_b, _b_rx) = network.join("b").unwrap();

        let result = a.send(&PeerId::new("b"), Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(SessionError::PeerNotFound(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let network = MemoryNetwork::new();
        let _first = network.join("same").unwrap();
        assert!(network.join("same").is_err());
    }
}
