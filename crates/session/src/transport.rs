use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::peer::PeerId;

/// What a transport reports back to the session that owns it.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer advertising the browsed service was seen.
    Discovered(PeerId),
    /// A previously discovered peer stopped advertising.
    Lost(PeerId),
    /// A connection is up, whether we dialed it or the peer did.
    Connected(PeerId),
    /// A connection went away. Emitted once per connection.
    Disconnected(PeerId),
    Received { peer: PeerId, payload: Bytes },
}

/// Receiving end handed out when a transport is constructed.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Peer-to-peer channel consumed by the session manager.
///
/// Implementations must deliver payloads to a single peer reliably and in
/// order, and must encrypt anything that leaves the process.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> &PeerId;

    async fn advertise(&self, service_type: &str) -> Result<()>;

    async fn stop_advertising(&self) -> Result<()>;

    async fn browse(&self, service_type: &str) -> Result<()>;

    async fn stop_browsing(&self) -> Result<()>;

    /// Establish a connection. On success a `Connected` event follows;
    /// on failure no event is emitted and the error is returned.
    async fn connect(&self, peer: &PeerId) -> Result<()>;

    /// Tear down a connection. A `Disconnected` event follows if one existed.
    async fn disconnect(&self, peer: &PeerId) -> Result<()>;

    /// Returns once the payload has been handed to the peer's stream.
    async fn send(&self, peer: &PeerId, payload: Bytes) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
