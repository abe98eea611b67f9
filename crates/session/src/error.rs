use thiserror::Error;

/// Errors that can occur in peer session operations.
///
/// Connection failures are not returned to callers of `connect`; they are
/// reported as a `Disconnected` state change on the event stream instead.
/// The variants here cover misuse of the session API and failures inside
/// a transport implementation.
#[derive(Error, Debug)]
pub enum SessionError {
    /// An advertise or browse operation is already active
    #[error("mode conflict: {0}")]
    ModeConflict(String),

    /// Service type does not satisfy the naming rules
    #[error("invalid service type: {0}")]
    InvalidServiceType(String),

    /// Display name is empty or too long
    #[error("invalid display name: {0}")]
    InvalidDisplayName(String),

    /// Outbound payload exceeds the configured cap
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Failed to establish connection to peer
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A live connection to the peer already exists, e.g. after both
    /// sides dialed at once
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    /// Requested peer is not known to the transport
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Transport-level failure not covered by a more specific variant
    #[error("transport error: {0}")]
    Transport(String),

    /// Encryption operation failed
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Decryption operation failed
    #[error("decryption error: {0}")]
    Decryption(String),

    /// Wire protocol violation or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to serialize or deserialize a frame
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Communication channel was closed
    #[error("channel closed")]
    ChannelClosed,

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
