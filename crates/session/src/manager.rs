use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::{EventBus, SessionEvent};
use crate::peer::{PeerId, PeerInfo, PeerState, PeerTable};
use crate::transport::{Transport, TransportEvent, TransportEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Advertising,
    Browsing,
}

/// Who a payload is addressed to.
#[derive(Debug, Clone)]
pub enum Recipients {
    /// Every peer connected at the time of the call.
    All,
    Peers(BTreeSet<PeerId>),
}

impl Recipients {
    pub fn one(peer: PeerId) -> Self {
        Recipients::Peers(BTreeSet::from([peer]))
    }
}

struct Inner {
    config: SessionConfig,
    local_peer: PeerId,
    transport: Arc<dyn Transport>,
    peers: PeerTable,
    events: EventBus,
    mode: Mutex<Mode>,
    browser_tx: SyncMutex<Option<mpsc::UnboundedSender<PeerId>>>,
    outbound: SyncMutex<HashMap<PeerId, mpsc::UnboundedSender<Bytes>>>,
    /// Dials in flight, flagged once `disconnect` cancels them. A cancelled
    /// dial that still connected stays here until its `Disconnected` event
    /// reaches the pump.
    dials: SyncMutex<HashMap<PeerId, bool>>,
    pump: SyncMutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Owns the local peer identity, the table of known peers and the
/// advertise/browse mode of one session.
///
/// Transport events are drained by a single background task. That task and
/// the manager's own methods are the only writers of the peer table.
/// Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Validate `config`, take ownership of the transport's event stream and
    /// start processing it. Must be called inside a tokio runtime.
    pub fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        transport_events: TransportEvents,
    ) -> Result<Self> {
        config.validate()?;

        let local_peer = transport.local_peer().clone();
        if local_peer.display_name() != config.display_name {
            return Err(SessionError::InvalidDisplayName(format!(
                "transport identity '{}' does not match configured name '{}'",
                local_peer, config.display_name
            )));
        }

        let inner = Arc::new(Inner {
            events: EventBus::new(config.event_capacity),
            config,
            local_peer,
            transport,
            peers: PeerTable::new(),
            mode: Mutex::new(Mode::Idle),
            browser_tx: SyncMutex::new(None),
            outbound: SyncMutex::new(HashMap::new()),
            dials: SyncMutex::new(HashMap::new()),
            pump: SyncMutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handle = tokio::spawn(run_pump(Arc::clone(&inner), transport_events));
        *inner.pump.lock() = Some(handle);

        info!(
            peer = %inner.local_peer,
            service = %inner.config.service_type,
            "Session started"
        );

        Ok(Self { inner })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn mode(&self) -> Mode {
        *self.inner.mode.lock().await
    }

    /// Advertise the local peer on the configured service type.
    ///
    /// Calling this while already advertising does nothing. Calling it while
    /// browsing is a [`SessionError::ModeConflict`].
    pub async fn start_hosting(&self) -> Result<()> {
        self.ensure_running()?;
        let mut mode = self.inner.mode.lock().await;

        match *mode {
            Mode::Advertising => {
                warn!("Already advertising, ignoring start_hosting");
                Ok(())
            }
            Mode::Browsing => Err(SessionError::ModeConflict(
                "cannot advertise while browsing".to_string(),
            )),
            Mode::Idle => {
                self.inner
                    .transport
                    .advertise(&self.inner.config.service_type)
                    .await?;
                *mode = Mode::Advertising;
                info!(service = %self.inner.config.service_type, "Hosting started");
                Ok(())
            }
        }
    }

    pub async fn stop_hosting(&self) -> Result<()> {
        let mut mode = self.inner.mode.lock().await;
        if *mode != Mode::Advertising {
            return Ok(());
        }
        self.inner.transport.stop_advertising().await?;
        *mode = Mode::Idle;
        info!("Hosting stopped");
        Ok(())
    }

    /// Start looking for advertised peers.
    ///
    /// Browsing lasts until the returned handle selects a peer, is
    /// cancelled, or is dropped.
    pub async fn start_browsing(&self) -> Result<Browser> {
        self.ensure_running()?;
        let mut mode = self.inner.mode.lock().await;

        if *mode != Mode::Idle {
            return Err(SessionError::ModeConflict(format!(
                "cannot browse while {:?}",
                *mode
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.browser_tx.lock() = Some(tx);

        if let Err(e) = self
            .inner
            .transport
            .browse(&self.inner.config.service_type)
            .await
        {
            self.inner.browser_tx.lock().take();
            return Err(e);
        }

        *mode = Mode::Browsing;
        info!(service = %self.inner.config.service_type, "Browsing started");

        Ok(Browser {
            session: self.clone(),
            discovered: rx,
            finished: false,
        })
    }

    /// Move `peer` to `Connecting` and ask the transport to connect.
    ///
    /// Peers that are already connecting or connected are left alone.
    /// Failure is reported as a `Disconnected` state change, never returned.
    pub async fn connect(&self, peer: &PeerId) {
        if self.inner.shut_down.load(Ordering::SeqCst) || *peer == self.inner.local_peer {
            return;
        }
        if !self.inner.transition(peer, PeerState::Connecting).await {
            debug!(%peer, "Connect ignored, peer already connecting or connected");
            return;
        }

        self.inner.dials.lock().insert(peer.clone(), false);
        let outcome = self.inner.transport.connect(peer).await;
        let cancelled = self.inner.dials.lock().get(peer).copied().unwrap_or(false);

        match outcome {
            // A simultaneous inbound dial won; that connection is the live one.
            Ok(()) | Err(SessionError::AlreadyConnected(_)) => {
                if !cancelled {
                    self.inner.dials.lock().remove(peer);
                    return;
                }
                debug!(%peer, "Dial completed after disconnect, closing it");
                if let Err(e) = self.inner.transport.disconnect(peer).await {
                    warn!(%peer, error = %e, "Transport disconnect failed");
                    self.inner.dials.lock().remove(peer);
                }
            }
            Err(e) => {
                self.inner.dials.lock().remove(peer);
                warn!(%peer, error = %e, "Connection attempt failed");
                if self.inner.peers.state(peer).await == Some(PeerState::Connecting) {
                    self.inner.transition(peer, PeerState::Disconnected).await;
                }
            }
        }
    }

    /// Drop the connection to `peer`. Unknown peers are ignored.
    pub async fn disconnect(&self, peer: &PeerId) {
        match self.inner.peers.state(peer).await {
            None | Some(PeerState::Disconnected) => {}
            Some(PeerState::Discovered) => {
                if self.inner.peers.forget_discovered(peer).await {
                    self.inner.publish_state(peer, PeerState::Disconnected);
                }
            }
            Some(PeerState::Connecting) | Some(PeerState::Connected) => {
                if let Some(cancelled) = self.inner.dials.lock().get_mut(peer) {
                    *cancelled = true;
                }
                if let Err(e) = self.inner.transport.disconnect(peer).await {
                    warn!(%peer, error = %e, "Transport disconnect failed");
                }
                // The transport's Disconnected event finishes the job; this
                // covers a transport that had no live connection.
                if self.inner.peers.state(peer).await == Some(PeerState::Connecting) {
                    self.inner.transition(peer, PeerState::Disconnected).await;
                }
            }
        }
    }

    /// Queue `payload` for each recipient and return immediately.
    ///
    /// Delivery runs on one task per peer, so order is kept per peer and a
    /// failure for one peer does not affect the others. Failures show up as
    /// [`SessionEvent::SendFailed`].
    pub fn send(&self, payload: impl Into<Bytes>, recipients: Recipients) -> Result<()> {
        self.ensure_running()?;

        let payload = payload.into();
        let max = self.inner.config.max_payload_size;
        if payload.len() > max {
            return Err(SessionError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let outbound = self.inner.outbound.lock();
        match recipients {
            Recipients::All => {
                for (peer, queue) in outbound.iter() {
                    if queue.send(payload.clone()).is_err() {
                        self.inner.publish_send_failed(peer, "outbound queue closed");
                    }
                }
            }
            Recipients::Peers(targets) => {
                for peer in targets {
                    match outbound.get(&peer) {
                        Some(queue) => {
                            if queue.send(payload.clone()).is_err() {
                                self.inner.publish_send_failed(&peer, "outbound queue closed");
                            }
                        }
                        None => self.inner.publish_send_failed(&peer, "peer not connected"),
                    }
                }
            }
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe_all()
    }

    /// Events whose kind matches `pattern`, e.g. `"peer.data"` or `"peer.*"`.
    pub fn subscribe_filtered(&self, pattern: &str) -> mpsc::Receiver<SessionEvent> {
        self.inner.events.subscribe(pattern)
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.list().await
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.peers.connected().await
    }

    pub async fn peer_state(&self, peer: &PeerId) -> Option<PeerState> {
        self.inner.peers.state(peer).await
    }

    /// Stop advertising or browsing, drop every peer and stop background
    /// work. Every step runs even if an earlier one fails; the first error
    /// is returned. Calling it again after it completed does nothing.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;

        {
            let mut mode = self.inner.mode.lock().await;
            let stopped = match *mode {
                Mode::Advertising => self.inner.transport.stop_advertising().await,
                Mode::Browsing => self.inner.transport.stop_browsing().await,
                Mode::Idle => Ok(()),
            };
            if let Err(e) = stopped {
                warn!(error = %e, mode = ?*mode, "Failed to stop during shutdown");
                first_error.get_or_insert(e);
            }
            *mode = Mode::Idle;
        }
        self.inner.browser_tx.lock().take();

        let connected = self.inner.peers.connected().await;
        let results = join_all(
            connected
                .iter()
                .map(|peer| self.inner.transport.disconnect(peer)),
        )
        .await;
        for (peer, result) in connected.iter().zip(results) {
            if let Err(e) = result {
                warn!(%peer, error = %e, "Disconnect during shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.inner.transport.shutdown().await {
            warn!(error = %e, "Transport shutdown failed");
            first_error.get_or_insert(e);
        }

        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        self.inner.outbound.lock().clear();
        self.inner.shut_down.store(true, Ordering::SeqCst);

        for info in self.inner.peers.clear().await {
            self.inner.publish_state(&info.peer_id, PeerState::Disconnected);
        }

        info!(peer = %self.inner.local_peer, "Session shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelClosed);
        }
        Ok(())
    }

    async fn end_browsing(&self) -> Result<()> {
        let mut mode = self.inner.mode.lock().await;
        if *mode != Mode::Browsing {
            return Ok(());
        }

        self.inner.browser_tx.lock().take();
        self.inner.transport.stop_browsing().await?;
        *mode = Mode::Idle;

        for info in self.inner.peers.list().await {
            if info.state == PeerState::Discovered
                && self.inner.peers.forget_discovered(&info.peer_id).await
            {
                self.inner
                    .publish_state(&info.peer_id, PeerState::Disconnected);
            }
        }
        info!("Browsing stopped");
        Ok(())
    }
}

impl Inner {
    async fn transition(self: &Arc<Self>, peer: &PeerId, next: PeerState) -> bool {
        if !self.peers.apply(peer, next).await {
            return false;
        }

        match next {
            PeerState::Connected => self.open_outbound(peer),
            PeerState::Disconnected => {
                self.outbound.lock().remove(peer);
            }
            _ => {}
        }

        debug!(%peer, state = ?next, "Peer state changed");
        self.publish_state(peer, next);
        true
    }

    fn open_outbound(self: &Arc<Self>, peer: &PeerId) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        self.outbound.lock().insert(peer.clone(), tx);

        let inner = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = inner.transport.send(&peer, payload).await {
                    warn!(%peer, error = %e, "Send failed");
                    inner.publish_send_failed(&peer, &e.to_string());
                }
            }
            debug!(%peer, "Outbound queue closed");
        });
    }

    fn publish_state(&self, peer: &PeerId, state: PeerState) {
        self.events.publish(SessionEvent::PeerStateChanged {
            peer: peer.clone(),
            state,
        });
    }

    fn publish_send_failed(&self, peer: &PeerId, reason: &str) {
        self.events.publish(SessionEvent::SendFailed {
            peer: peer.clone(),
            reason: reason.to_string(),
        });
    }
}

async fn run_pump(inner: Arc<Inner>, mut transport_events: TransportEvents) {
    while let Some(event) = transport_events.recv().await {
        match event {
            TransportEvent::Discovered(peer) => {
                let browser = inner.browser_tx.lock().clone();
                let Some(browser) = browser else {
                    continue;
                };
                if inner.transition(&peer, PeerState::Discovered).await {
                    info!(%peer, "Discovered peer");
                    let _ = browser.send(peer);
                }
            }
            TransportEvent::Lost(peer) => {
                if inner.peers.forget_discovered(&peer).await {
                    debug!(%peer, "Peer stopped advertising");
                    inner.publish_state(&peer, PeerState::Disconnected);
                }
            }
            TransportEvent::Connected(peer) => {
                if inner.dials.lock().get(&peer).copied().unwrap_or(false) {
                    debug!(%peer, "Ignoring connection cancelled by disconnect");
                    continue;
                }
                if inner.transition(&peer, PeerState::Connected).await {
                    info!(%peer, "Peer connected");
                }
            }
            TransportEvent::Disconnected(peer) => {
                {
                    let mut dials = inner.dials.lock();
                    if dials.get(&peer) == Some(&true) {
                        dials.remove(&peer);
                    }
                }
                if inner.transition(&peer, PeerState::Disconnected).await {
                    info!(%peer, "Peer disconnected");
                }
            }
            TransportEvent::Received { peer, payload } => {
                inner.peers.touch(&peer).await;
                debug!(%peer, bytes = payload.len(), "Data received");
                inner
                    .events
                    .publish(SessionEvent::DataReceived { peer, payload });
            }
        }
    }
    debug!("Transport event stream ended");
}

/// Handle to an active browse operation.
pub struct Browser {
    session: SessionManager,
    discovered: mpsc::UnboundedReceiver<PeerId>,
    finished: bool,
}

impl Browser {
    /// Next newly discovered peer. `None` once browsing has ended.
    pub async fn next_peer(&mut self) -> Option<PeerId> {
        if self.finished {
            return None;
        }
        self.discovered.recv().await
    }

    /// Peers currently known through this browse operation.
    pub async fn discovered(&self) -> Vec<PeerId> {
        self.session
            .peers()
            .await
            .into_iter()
            .filter(|info| info.state == PeerState::Discovered)
            .map(|info| info.peer_id)
            .collect()
    }

    /// Connect to `peer` and end browsing.
    pub async fn select(mut self, peer: &PeerId) -> Result<()> {
        self.finished = true;
        self.session.connect(peer).await;
        self.session.end_browsing().await
    }

    pub async fn cancel(mut self) -> Result<()> {
        self.finished = true;
        self.session.end_browsing().await
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            runtime.spawn(async move {
                if let Err(e) = session.end_browsing().await {
                    warn!(error = %e, "Failed to stop browsing");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum Dial {
        Succeed,
        /// The remote side's inbound connection registers first.
        LoseRace,
    }

    /// Transport whose dial outcome and failures are fixed up front.
    struct ScriptedTransport {
        local: PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
        dial: Dial,
        dial_gate: Option<Arc<Notify>>,
        fail_stop_advertising: bool,
        links: SyncMutex<HashSet<PeerId>>,
        disconnects: SyncMutex<Vec<PeerId>>,
    }

    impl ScriptedTransport {
        fn new(name: &str, dial: Dial) -> (Self, TransportEvents) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                local: PeerId::new(name),
                events: tx,
                dial,
                dial_gate: None,
                fail_stop_advertising: false,
                links: SyncMutex::new(HashSet::new()),
                disconnects: SyncMutex::new(Vec::new()),
            };
            (transport, rx)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn local_peer(&self) -> &PeerId {
            &self.local
        }

        async fn advertise(&self, _service_type: &str) -> Result<()> {
            Ok(())
        }

        async fn stop_advertising(&self) -> Result<()> {
            if self.fail_stop_advertising {
                return Err(SessionError::Transport("multicast socket unavailable".to_string()));
            }
            Ok(())
        }

        async fn browse(&self, _service_type: &str) -> Result<()> {
            Ok(())
        }

        async fn stop_browsing(&self) -> Result<()> {
            Ok(())
        }

        async fn connect(&self, peer: &PeerId) -> Result<()> {
            if let Some(gate) = &self.dial_gate {
                gate.notified().await;
            }
            self.links.lock().insert(peer.clone());
            let _ = self.events.send(TransportEvent::Connected(peer.clone()));
            match self.dial {
                Dial::Succeed => Ok(()),
                Dial::LoseRace => Err(SessionError::AlreadyConnected(peer.to_string())),
            }
        }

        async fn disconnect(&self, peer: &PeerId) -> Result<()> {
            self.disconnects.lock().push(peer.clone());
            if self.links.lock().remove(peer) {
                let _ = self.events.send(TransportEvent::Disconnected(peer.clone()));
            }
            Ok(())
        }

        async fn send(&self, _peer: &PeerId, _payload: Bytes) -> Result<()> {
            Ok(())
        }
    }

    fn scripted(transport: ScriptedTransport, events: TransportEvents) -> (SessionManager, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let name = transport.local.display_name().to_string();
        let session = SessionManager::start(
            SessionConfig::new(name),
            Arc::clone(&transport) as Arc<dyn Transport>,
            events,
        )
        .unwrap();
        (session, transport)
    }

    fn session(network: &MemoryNetwork, name: &str) -> SessionManager {
        let (transport, events) = network.join(name).unwrap();
        SessionManager::start(SessionConfig::new(name), Arc::new(transport), events).unwrap()
    }

    async fn wait_for_state(
        rx: &mut broadcast::Receiver<SessionEvent>,
        name: &str,
        wanted: PeerState,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SessionEvent::PeerStateChanged { peer, state }) = rx.recv().await {
                    if peer.display_name() == name && state == wanted {
                        return;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for state change");
    }

    #[tokio::test]
    async fn test_hosting_is_idempotent() {
        let network = MemoryNetwork::new();
        let host = session(&network, "host");

        host.start_hosting().await.unwrap();
        host.start_hosting().await.unwrap();
        assert_eq!(host.mode().await, Mode::Advertising);
    }

    #[tokio::test]
    async fn test_browse_while_hosting_conflicts() {
        let network = MemoryNetwork::new();
        let host = session(&network, "host");

        host.start_hosting().await.unwrap();
        assert!(matches!(
            host.start_browsing().await,
            Err(SessionError::ModeConflict(_))
        ));

        host.stop_hosting().await.unwrap();
        let browser = host.start_browsing().await.unwrap();
        assert!(matches!(
            host.start_hosting().await,
            Err(SessionError::ModeConflict(_))
        ));
        browser.cancel().await.unwrap();
        assert_eq!(host.mode().await, Mode::Idle);
    }

    #[tokio::test]
    async fn test_mismatched_identity_rejected() {
        let network = MemoryNetwork::new();
        let (transport, events) = network.join("alice").unwrap();
        let result = SessionManager::start(SessionConfig::new("bob"), Arc::new(transport), events);
        assert!(matches!(result, Err(SessionError::InvalidDisplayName(_))));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_peer_is_noop() {
        let network = MemoryNetwork::new();
        let alice = session(&network, "alice");
        let mut events = alice.subscribe();

        alice.disconnect(&PeerId::new("nobody")).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let network = MemoryNetwork::new();
        let (transport, events) = network.join("alice").unwrap();
        let alice = SessionManager::start(
            SessionConfig::new("alice").with_max_payload_size(4),
            Arc::new(transport),
            events,
        )
        .unwrap();

        let result = alice.send(vec![0u8; 5], Recipients::All);
        assert!(matches!(
            result,
            Err(SessionError::PayloadTooLarge { size: 5, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_send_to_unconnected_peer_reports_failure() {
        let network = MemoryNetwork::new();
        let alice = session(&network, "alice");
        let mut failures = alice.subscribe_filtered("peer.send_failed");

        alice
            .send(&b"hello"[..], Recipients::one(PeerId::new("bob")))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.peer().display_name(), "bob");
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let network = MemoryNetwork::new();
        let alice = session(&network, "alice");
        let _bob = session(&network, "bob");
        let mut events = alice.subscribe();
        let bob_id = PeerId::new("bob");

        alice.connect(&bob_id).await;
        wait_for_state(&mut events, "bob", PeerState::Connected).await;
        assert_eq!(alice.connected_peers().await, vec![bob_id.clone()]);

        alice.disconnect(&bob_id).await;
        wait_for_state(&mut events, "bob", PeerState::Disconnected).await;
        assert!(alice.peer_state(&bob_id).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let network = MemoryNetwork::new();
        let alice = session(&network, "alice");
        alice.start_hosting().await.unwrap();

        alice.shutdown().await.unwrap();
        alice.shutdown().await.unwrap();
        assert!(alice.start_hosting().await.is_err());
        assert!(alice.send(&b"x"[..], Recipients::All).is_err());
    }

    #[tokio::test]
    async fn test_dial_losing_race_keeps_live_connection() {
        let (transport, events) = ScriptedTransport::new("alice", Dial::LoseRace);
        let (alice, _transport) = scripted(transport, events);
        let mut states = alice.subscribe();
        let bob = PeerId::new("bob");

        alice.connect(&bob).await;
        wait_for_state(&mut states, "bob", PeerState::Connected).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(alice.peer_state(&bob).await, Some(PeerState::Connected));
        let mut failures = alice.subscribe_filtered("peer.send_failed");
        alice.send(&b"still here"[..], Recipients::one(bob.clone())).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), failures.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_disconnect_during_dial_closes_late_connection() {
        let (mut transport, events) = ScriptedTransport::new("alice", Dial::Succeed);
        let gate = Arc::new(Notify::new());
        transport.dial_gate = Some(Arc::clone(&gate));
        let (alice, transport) = scripted(transport, events);
        let mut states = alice.subscribe();
        let bob = PeerId::new("bob");

        let dialing = {
            let alice = alice.clone();
            let bob = bob.clone();
            tokio::spawn(async move { alice.connect(&bob).await })
        };
        wait_for_state(&mut states, "bob", PeerState::Connecting).await;

        alice.disconnect(&bob).await;
        wait_for_state(&mut states, "bob", PeerState::Disconnected).await;

        gate.notify_one();
        dialing.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(alice.peer_state(&bob).await.is_none());
        assert!(transport.links.lock().is_empty());
        assert!(std::iter::from_fn(|| states.try_recv().ok())
            .all(|e| !matches!(e, SessionEvent::PeerStateChanged { state: PeerState::Connected, .. })));
    }

    #[tokio::test]
    async fn test_shutdown_finishes_when_a_step_fails() {
        let (mut transport, events) = ScriptedTransport::new("alice", Dial::Succeed);
        transport.fail_stop_advertising = true;
        let (alice, transport) = scripted(transport, events);
        let mut states = alice.subscribe();
        let bob = PeerId::new("bob");

        alice.start_hosting().await.unwrap();
        alice.connect(&bob).await;
        wait_for_state(&mut states, "bob", PeerState::Connected).await;

        assert!(matches!(alice.shutdown().await, Err(SessionError::Transport(_))));
        assert!(alice.peers().await.is_empty());
        assert_eq!(alice.mode().await, Mode::Idle);
        assert_eq!(*transport.disconnects.lock(), vec![bob]);
        assert!(alice.send(&b"x"[..], Recipients::All).is_err());

        alice.shutdown().await.unwrap();
    }
}
