//! Network error types.

use crate::message::DisconnectReason;
use basalt_discovery::NodeId;
use thiserror::Error;

/// Errors produced by the networking core.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Socket read or write failure. Terminates the affected peer only.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write deadline elapsed. Terminates the affected peer.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// Unknown protocol code or malformed payload. Terminates the peer.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame payload exceeds the configured cap.
    #[error("frame too large: {size} bytes, max {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Capability exchange could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Inbound handshake from a node id missing from the discovery
    /// snapshot. The connection is closed; no peer is admitted.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// Outbound send to a capability absent from the negotiated table.
    /// Surfaced to the sub-protocol; the peer stays connected.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The remote sent a disc frame. Terminates the peer.
    #[error("remote disconnected: {0}")]
    RemoteDisconnect(DisconnectReason),

    /// A local disconnect request terminated the peer.
    #[error("disconnect requested: {0}")]
    DisconnectRequested(DisconnectReason),

    /// Send attempted after the peer's closed signal.
    #[error("peer closed")]
    PeerClosed,

    /// Start called on a running server.
    #[error("server already running")]
    AlreadyRunning,

    /// Server options that cannot work.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
