//! Local network transport.
//!
//! Peers announce themselves over UDP multicast and exchange data over TCP.
//! Every TCP connection opens with an X25519 exchange carried in `Hello`
//! frames; everything after that is sealed with ChaCha20-Poly1305.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::crypto::{KeyExchange, SessionKeys};
use crate::error::{Result, SessionError};
use crate::peer::PeerId;
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::wire::{read_frame, write_frame, Announcement, Frame, SealedFrame, PROTOCOL_VERSION};

const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 78);
const MULTICAST_PORT: u16 = 7657;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
const SIGHTING_EXPIRY: Duration = Duration::from_secs(7);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Sighting {
    addr: SocketAddr,
    last_seen: Instant,
}

struct Connection {
    id: u64,
    writer: Mutex<OwnedWriteHalf>,
    keys: SessionKeys,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    async fn send_sealed(&self, frame: &SealedFrame) -> Result<()> {
        let sealed = self.keys.encrypt(&frame.encode()?)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &Frame::Sealed(sealed)).await
    }
}

struct Shared {
    local_peer: PeerId,
    service_type: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    connections: SyncRwLock<HashMap<PeerId, Arc<Connection>>>,
    sightings: SyncRwLock<HashMap<PeerId, Sighting>>,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Register a freshly handshaken connection and start reading from it.
    fn register(
        self: &Arc<Self>,
        peer: PeerId,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        keys: SessionKeys,
    ) -> Result<()> {
        let connection = Arc::new(Connection {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(writer),
            keys,
            reader: SyncMutex::new(None),
        });

        {
            let mut connections = self.connections.write();
            if connections.contains_key(&peer) {
                return Err(SessionError::AlreadyConnected(peer.to_string()));
            }
            connections.insert(peer.clone(), Arc::clone(&connection));
        }

        info!(%peer, "LAN connection established");
        self.emit(TransportEvent::Connected(peer.clone()));

        let handle = tokio::spawn(run_reader(
            Arc::clone(self),
            peer,
            Arc::clone(&connection),
            reader,
        ));
        *connection.reader.lock() = Some(handle);
        Ok(())
    }

    /// Remove `connection` if it is still the live one for `peer`.
    fn release(&self, peer: &PeerId, connection_id: u64) -> bool {
        let mut connections = self.connections.write();
        match connections.get(peer) {
            Some(current) if current.id == connection_id => {
                connections.remove(peer);
                true
            }
            _ => false,
        }
    }

    fn local_hello(&self, exchange: &KeyExchange) -> Frame {
        Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            display_name: self.local_peer.display_name().to_string(),
            service_type: self.service_type.clone(),
            x25519_pubkey: exchange.public_key(),
        }
    }

    fn check_hello(&self, frame: Frame) -> Result<(PeerId, [u8; 32])> {
        match frame {
            Frame::Hello {
                protocol_version,
                display_name,
                service_type,
                x25519_pubkey,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(SessionError::Protocol(format!(
                        "unsupported protocol version {}",
                        protocol_version
                    )));
                }
                if service_type != self.service_type {
                    return Err(SessionError::Protocol(format!(
                        "service mismatch: {}",
                        service_type
                    )));
                }
                let peer = PeerId::new(display_name);
                if peer == self.local_peer {
                    return Err(SessionError::Protocol("connection to self".to_string()));
                }
                Ok((peer, x25519_pubkey))
            }
            Frame::Sealed(_) => Err(SessionError::Protocol(
                "expected hello before sealed frames".to_string(),
            )),
        }
    }
}

/// UDP multicast discovery plus encrypted TCP streams.
pub struct LanTransport {
    shared: Arc<Shared>,
    port: u16,
    listener: SyncMutex<Option<JoinHandle<()>>>,
    advertiser: SyncMutex<Option<JoinHandle<()>>>,
    browser: SyncMutex<Option<JoinHandle<()>>>,
}

impl LanTransport {
    /// Bind the TCP listener on `config.lan_port` (0 picks a free port) and
    /// start accepting connections.
    pub async fn bind(config: &SessionConfig) -> Result<(Self, TransportEvents)> {
        config.validate()?;

        let listener =
            TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.lan_port)).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            local_peer: PeerId::new(config.display_name.clone()),
            service_type: config.service_type.clone(),
            events: tx,
            connections: SyncRwLock::new(HashMap::new()),
            sightings: SyncRwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
        });

        let accept = tokio::spawn(run_acceptor(Arc::clone(&shared), listener));
        info!(port, peer = %shared.local_peer, "LAN transport listening");

        Ok((
            Self {
                shared,
                port,
                listener: SyncMutex::new(Some(accept)),
                advertiser: SyncMutex::new(None),
                browser: SyncMutex::new(None),
            },
            rx,
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Record a peer's address without waiting for a multicast announcement.
    pub fn add_known_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.shared.sightings.write().insert(
            peer,
            Sighting {
                addr,
                last_seen: Instant::now(),
            },
        );
    }

    fn announcement(&self, service_type: &str, goodbye: bool) -> Announcement {
        Announcement {
            display_name: self.shared.local_peer.display_name().to_string(),
            service_type: service_type.to_string(),
            port: self.port,
            goodbye,
        }
    }

    async fn connect_inner(&self, peer: &PeerId, addr: SocketAddr) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::ConnectionFailed(format!("timed out dialing {}", addr)))??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let exchange = KeyExchange::new();
        let hello = self.shared.local_hello(&exchange);
        let remote_key = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            write_frame(&mut writer, &hello).await?;
            let (remote, remote_key) = self.shared.check_hello(read_frame(&mut reader).await?)?;
            if remote != *peer {
                return Err(SessionError::ConnectionFailed(format!(
                    "expected {} but {} answered",
                    peer, remote
                )));
            }
            Ok(remote_key)
        })
        .await
        .map_err(|_| SessionError::ConnectionFailed("handshake timed out".to_string()))??;

        let keys = exchange.derive(remote_key)?;
        self.shared.register(peer.clone(), reader, writer, keys)
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn local_peer(&self) -> &PeerId {
        &self.shared.local_peer
    }

    async fn advertise(&self, service_type: &str) -> Result<()> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        let packet = self.announcement(service_type, false).encode();

        let handle = tokio::spawn(async move {
            let target = SocketAddr::V4(SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT));
            let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = socket.send_to(&packet, target).await {
                    warn!("Failed to send multicast announce: {}", e);
                } else {
                    debug!("Sent discovery announce");
                }
            }
        });

        if let Some(previous) = self.advertiser.lock().replace(handle) {
            previous.abort();
        }
        info!(service = %service_type, port = self.port, "Advertising on LAN");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let handle = self.advertiser.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.abort();

        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        let packet = self.announcement(&self.shared.service_type, true).encode();
        if let Err(e) = socket
            .send_to(&packet, SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT))
            .await
        {
            debug!("Failed to send goodbye announce: {}", e);
        }
        Ok(())
    }

    async fn browse(&self, service_type: &str) -> Result<()> {
        let socket = multicast_listener()?;
        let shared = Arc::clone(&self.shared);
        let service_type = service_type.to_string();

        let handle = tokio::spawn(run_browser(shared, socket, service_type));
        if let Some(previous) = self.browser.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        if let Some(handle) = self.browser.lock().take() {
            handle.abort();
        }

        // A later browse must report hosts that are still announcing.
        {
            let connections = self.shared.connections.read();
            self.shared
                .sightings
                .write()
                .retain(|peer, _| connections.contains_key(peer));
        }
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<()> {
        if self.shared.connections.read().contains_key(peer) {
            return Ok(());
        }

        let addr = self
            .shared
            .sightings
            .read()
            .get(peer)
            .map(|sighting| sighting.addr)
            .ok_or_else(|| SessionError::PeerNotFound(peer.to_string()))?;

        self.connect_inner(peer, addr).await
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        let connection = self.shared.connections.write().remove(peer);
        let Some(connection) = connection else {
            return Ok(());
        };

        if let Some(reader) = connection.reader.lock().take() {
            reader.abort();
        }
        if let Err(e) = connection.send_sealed(&SealedFrame::Bye).await {
            debug!(%peer, "Failed to send goodbye: {}", e);
        }

        info!(%peer, "LAN connection closed");
        self.shared.emit(TransportEvent::Disconnected(peer.clone()));
        Ok(())
    }

    async fn send(&self, peer: &PeerId, payload: Bytes) -> Result<()> {
        let connection = self
            .shared
            .connections
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| SessionError::PeerNotFound(peer.to_string()))?;

        connection
            .send_sealed(&SealedFrame::Data(payload.to_vec()))
            .await
    }

    async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;

        if let Err(e) = self.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.stop_browsing().await {
            warn!("Failed to stop browsing: {}", e);
            first_error.get_or_insert(e);
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }

        let peers: Vec<PeerId> = self.shared.connections.read().keys().cloned().collect();
        for peer in peers {
            if let Err(e) = self.disconnect(&peer).await {
                warn!(%peer, "Failed to disconnect: {}", e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        for slot in [&self.listener, &self.advertiser, &self.browser] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

fn multicast_listener() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

async fn run_browser(shared: Arc<Shared>, socket: UdpSocket, service_type: String) {
    let mut buf = [0u8; 1024];
    info!(service = %service_type, "LAN discovery started on port {}", MULTICAST_PORT);

    loop {
        match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, src))) => {
                let Some(announcement) = Announcement::parse(&buf[..len]) else {
                    continue;
                };
                if announcement.service_type != service_type {
                    continue;
                }
                let peer = PeerId::new(announcement.display_name);
                if peer == shared.local_peer {
                    continue;
                }

                if announcement.goodbye {
                    if shared.sightings.write().remove(&peer).is_some() {
                        shared.emit(TransportEvent::Lost(peer));
                    }
                    continue;
                }

                let addr = SocketAddr::new(src.ip(), announcement.port);
                let is_new = shared
                    .sightings
                    .write()
                    .insert(
                        peer.clone(),
                        Sighting {
                            addr,
                            last_seen: Instant::now(),
                        },
                    )
                    .is_none();
                if is_new {
                    info!("Discovered new peer: {} at {}", peer, addr);
                    shared.emit(TransportEvent::Discovered(peer));
                }
            }
            Ok(Err(e)) => {
                warn!("UDP recv error: {}", e);
            }
            Err(_) => {}
        }

        let expired: Vec<PeerId> = {
            let mut sightings = shared.sightings.write();
            let expired: Vec<PeerId> = sightings
                .iter()
                .filter(|(_, s)| s.last_seen.elapsed() > SIGHTING_EXPIRY)
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in &expired {
                sightings.remove(peer);
            }
            expired
        };
        for peer in expired {
            debug!("Peer announcement expired: {}", peer);
            shared.emit(TransportEvent::Lost(peer));
        }
    }
}

async fn run_acceptor(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Incoming connection from {}", addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(shared, stream).await {
                        warn!("Rejected connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

async fn accept_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let exchange = KeyExchange::new();

    let hello = shared.local_hello(&exchange);

    let (peer, remote_key) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let (peer, remote_key) = shared.check_hello(read_frame(&mut reader).await?)?;
        if shared.connections.read().contains_key(&peer) {
            return Err(SessionError::AlreadyConnected(peer.to_string()));
        }
        write_frame(&mut writer, &hello).await?;
        Ok((peer, remote_key))
    })
    .await
    .map_err(|_| SessionError::ConnectionFailed("handshake timed out".to_string()))??;

    let keys = exchange.derive(remote_key)?;
    shared.register(peer, reader, writer, keys)
}

async fn run_reader(
    shared: Arc<Shared>,
    peer: PeerId,
    connection: Arc<Connection>,
    mut reader: OwnedReadHalf,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer, "Connection read ended: {}", e);
                break;
            }
        };

        let opened = match frame {
            Frame::Sealed(sealed) => connection
                .keys
                .decrypt(&sealed)
                .and_then(|plain| SealedFrame::decode(&plain)),
            Frame::Hello { .. } => Err(SessionError::Protocol("unexpected hello".to_string())),
        };

        match opened {
            Ok(SealedFrame::Data(payload)) => {
                shared.emit(TransportEvent::Received {
                    peer: peer.clone(),
                    payload: Bytes::from(payload),
                });
            }
            Ok(SealedFrame::Bye) => {
                debug!(%peer, "Peer said goodbye");
                break;
            }
            Err(e) => {
                warn!(%peer, "Dropping connection: {}", e);
                break;
            }
        }
    }

    if shared.release(&peer, connection.id) {
        info!(%peer, "LAN connection closed by peer");
        shared.emit(TransportEvent::Disconnected(peer));
    }
}
