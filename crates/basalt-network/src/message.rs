//! Protocol codes, control messages, and inbound application messages.

use crate::peer::Peer;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Protocol code reserved for the control channel.
pub const CTL_PROTO_CODE: u16 = 1;

/// First code handed to negotiated sub-protocols.
pub const BASE_PROTO_CODE: u16 = 2;

/// Control message: capability handshake. Payload is the serialized hello.
pub const CTL_MSG_HANDSHAKE: u16 = 1;

/// Control message: disconnect. Payload is one reason byte.
pub const CTL_MSG_DISC: u16 = 2;

/// Control message: heartbeat ping. Empty payload.
pub const CTL_MSG_PING: u16 = 3;

/// Control message: heartbeat acknowledgement. Empty payload.
pub const CTL_MSG_PONG: u16 = 4;

/// Reason carried by a control disc frame.
///
/// Codes are stable within a deployment; unknown codes pass through
/// unmodified so endpoints on different revisions stay interoperable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application asked for the disconnect.
    Requested,
    /// The server already holds a connection for this node id.
    AlreadyConnected,
    /// The server is shutting down.
    ServerQuit,
    /// A code this revision does not name.
    Other(u8),
}

impl DisconnectReason {
    /// Wire code of the reason.
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::Requested => 1,
            DisconnectReason::AlreadyConnected => 10,
            DisconnectReason::ServerQuit => 11,
            DisconnectReason::Other(code) => *code,
        }
    }

    /// Reason for a wire code.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => DisconnectReason::Requested,
            10 => DisconnectReason::AlreadyConnected,
            11 => DisconnectReason::ServerQuit,
            other => DisconnectReason::Other(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested (1)"),
            DisconnectReason::AlreadyConnected => write!(f, "already connected (10)"),
            DisconnectReason::ServerQuit => write!(f, "server quit (11)"),
            DisconnectReason::Other(code) => write!(f, "code {code}"),
        }
    }
}

/// An application message demultiplexed to a sub-protocol.
///
/// Delivered in wire order per connection. The peer handle is shared;
/// sub-protocols release it when they see the peer-removed event.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Application-defined message code.
    pub msg_code: u16,
    /// Payload bytes.
    pub payload: Bytes,
    /// Monotonic timestamp taken when the frame was read.
    pub received_at: Instant,
    /// The connection the message arrived on.
    pub peer: Arc<Peer>,
}
