//! Peer sessions: discovery, connection lifecycle and message exchange.
//!
//! A [`SessionManager`] sits on top of a [`Transport`]. It keeps the table
//! of known peers, enforces the per-peer state machine
//! (`Discovered -> Connecting -> Connected -> Disconnected`) and publishes
//! [`SessionEvent`]s. Payloads are opaque bytes.

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod lan;
pub mod manager;
pub mod memory;
pub mod peer;
pub mod transport;
pub mod wire;

pub use config::{SessionConfig, DEFAULT_SERVICE_TYPE, MAX_DISPLAY_NAME_LEN};
pub use error::{Result, SessionError};
pub use events::{EventBus, SessionEvent};
pub use lan::LanTransport;
pub use manager::{Browser, Mode, Recipients, SessionManager};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peer::{PeerId, PeerInfo, PeerState, PeerTable};
pub use transport::{Transport, TransportEvent, TransportEvents};
