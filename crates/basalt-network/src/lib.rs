//! # basalt-network
//!
//! P2P networking core for the basalt node.
//!
//! This crate provides:
//! - Length-prefixed binary framing with read/write deadlines
//! - Capability-negotiation handshake with per-connection code tables
//! - Peer lifecycle: one reader and one pinger per connection, serialized
//!   writes, heartbeats, idempotent disconnect
//! - Sub-protocol host interface over bounded queues
//! - Dial scheduling from discovery snapshots and token-bounded inbound
//!   admission, reconciled by a single peer-map owner task

mod config;
mod error;
mod frame;
mod handshake;
mod message;
mod peer;
mod protocol;
mod server;

pub use config::{ConnConfig, ServerConfig, DEFAULT_MAX_PENDING_PEERS};
pub use error::{NetworkError, NetworkResult};
pub use frame::{split_stream, Frame, FrameReader, FrameWriter, HEADER_LEN};
pub use handshake::{
    exchange, negotiate, session_secret, Capability, CodeTables, Hello, HelloExchange,
};
pub use message::{
    DisconnectReason, InboundMessage, BASE_PROTO_CODE, CTL_MSG_DISC, CTL_MSG_HANDSHAKE,
    CTL_MSG_PING, CTL_MSG_PONG, CTL_PROTO_CODE,
};
pub use peer::Peer;
pub use protocol::{
    protocol_channel, ProtocolEvents, ProtocolHost, RegisteredProtocol, DEFAULT_QUEUE_CAPACITY,
};
pub use server::Server;
