use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::peer::{PeerId, PeerState};

/// Notifications published by a session.
///
/// Events concerning one peer are published in the order they happened.
/// No ordering is promised between events of different peers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerStateChanged { peer: PeerId, state: PeerState },
    DataReceived { peer: PeerId, payload: Bytes },
    SendFailed { peer: PeerId, reason: String },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::PeerStateChanged { .. } => "peer.state",
            SessionEvent::DataReceived { .. } => "peer.data",
            SessionEvent::SendFailed { .. } => "peer.send_failed",
        }
    }

    pub fn peer(&self) -> &PeerId {
        match self {
            SessionEvent::PeerStateChanged { peer, .. }
            | SessionEvent::DataReceived { peer, .. }
            | SessionEvent::SendFailed { peer, .. } => peer,
        }
    }
}

struct Subscription {
    pattern: String,
    sender: mpsc::Sender<SessionEvent>,
}

/// Fan-out of session events to any number of subscribers.
pub struct EventBus {
    broadcast: broadcast::Sender<SessionEvent>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            broadcast,
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        let _ = self.broadcast.send(event.clone());

        let mut subscriptions = self.subscriptions.write();
        subscriptions.retain(|sub| !sub.sender.is_closed());
        for sub in subscriptions.iter() {
            if pattern_matches(&sub.pattern, event.kind()) {
                if let Err(e) = sub.sender.try_send(event.clone()) {
                    tracing::debug!(pattern = %sub.pattern, error = %e, "Dropped event for slow subscriber");
                }
            }
        }
    }

    /// Every event. Lagging receivers lose the oldest events.
    pub fn subscribe_all(&self) -> broadcast::Receiver<SessionEvent> {
        self.broadcast.subscribe()
    }

    /// Events whose kind matches `pattern` (`"*"`, `"peer.*"`, or an exact kind).
    pub fn subscribe(&self, pattern: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.subscriptions.write().push(Subscription {
            pattern: pattern.to_string(),
            sender: tx,
        });
        rx
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn pattern_matches(pattern: &str, kind: &str) -> bool {
    if pattern == "*" || pattern == kind {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return kind.starts_with(prefix) && kind[prefix.len()..].starts_with('.');
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return kind.starts_with(prefix);
    }
    false
}
