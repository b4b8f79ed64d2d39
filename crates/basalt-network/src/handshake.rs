//! Capability-negotiation handshake.
//!
//! On every new connection both endpoints symmetrically send one control
//! frame carrying their hello (node id, nonce, capability list), receive
//! the remote's hello, and derive the per-connection protocol code tables
//! from the common capability set. Both sides must derive identical tables
//! from identical inputs, so the common set is ordered by capability
//! string before codes are assigned.
//!
//! Hello payload layout, big-endian:
//!
//! ```text
//! node id (32) | nonce: u32 | cap count: u8 | { name len: u8, name, version: u32 }*
//! ```

use crate::error::{NetworkError, NetworkResult};
use crate::frame::{Frame, FrameReader, FrameWriter};
use crate::message::{BASE_PROTO_CODE, CTL_MSG_HANDSHAKE, CTL_PROTO_CODE};
use basalt_discovery::{NodeId, NODE_ID_LEN};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Upper bound on advertised capabilities in one hello.
const MAX_CAPABILITIES: usize = 64;

/// A named, versioned sub-protocol advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    /// Short protocol name, e.g. `chain` or `tx`.
    pub name: String,
    /// Protocol version.
    pub version: u32,
}

impl Capability {
    /// Create a capability.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// The hello each endpoint sends as the first frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Sender's node id.
    pub node_id: NodeId,
    /// Random 32-bit nonce, input to the session-secret hook.
    pub nonce: u32,
    /// Capabilities of the sender's registered sub-protocols.
    pub capabilities: Vec<Capability>,
}

impl Hello {
    /// Serialize the hello into a control-frame payload.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NODE_ID_LEN + 5 + self.capabilities.len() * 16);
        buf.put_slice(self.node_id.as_bytes());
        buf.put_u32(self.nonce);
        buf.put_u8(self.capabilities.len() as u8);
        for cap in &self.capabilities {
            let name = cap.name.as_bytes();
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
            buf.put_u32(cap.version);
        }
        buf.freeze()
    }

    /// Parse a hello payload.
    ///
    /// Truncated or malformed payloads are rejected, as is a zero-valued
    /// node id, so a hello that failed to populate its fields can never
    /// pass for a real participant.
    pub fn parse(data: &[u8]) -> NetworkResult<Self> {
        let mut buf = data;
        if buf.remaining() < NODE_ID_LEN + 4 + 1 {
            return Err(NetworkError::InvalidFrame("truncated hello".into()));
        }
        let mut id = [0u8; NODE_ID_LEN];
        buf.copy_to_slice(&mut id);
        let node_id = NodeId::from_bytes(id);
        if node_id.is_zero() {
            return Err(NetworkError::HandshakeFailed("zero node id".into()));
        }

        let nonce = buf.get_u32();
        let count = buf.get_u8() as usize;
        if count > MAX_CAPABILITIES {
            return Err(NetworkError::InvalidFrame(format!(
                "hello advertises {count} capabilities, max {MAX_CAPABILITIES}"
            )));
        }

        let mut capabilities = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err(NetworkError::InvalidFrame("truncated capability".into()));
            }
            let name_len = buf.get_u8() as usize;
            if buf.remaining() < name_len + 4 {
                return Err(NetworkError::InvalidFrame("truncated capability".into()));
            }
            let name_bytes = buf.copy_to_bytes(name_len);
            let name = std::str::from_utf8(&name_bytes)
                .map_err(|_| NetworkError::InvalidFrame("capability name not utf-8".into()))?
                .to_string();
            let version = buf.get_u32();
            capabilities.push(Capability { name, version });
        }

        Ok(Self {
            node_id,
            nonce,
            capabilities,
        })
    }
}

/// Result of a completed hello exchange.
#[derive(Debug)]
pub struct HelloExchange {
    /// The nonce this endpoint generated.
    pub local_nonce: u32,
    /// The remote's hello.
    pub remote: Hello,
}

/// Perform the symmetric hello exchange on a fresh connection.
///
/// Sends the local hello, then requires the first received frame to be the
/// control handshake. Anything else is an [`NetworkError::InvalidFrame`]
/// and the caller closes the connection without admitting a peer.
pub async fn exchange(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    local_id: NodeId,
    capabilities: Vec<Capability>,
) -> NetworkResult<HelloExchange> {
    let local_nonce: u32 = rand::random();
    let hello = Hello {
        node_id: local_id,
        nonce: local_nonce,
        capabilities,
    };
    writer
        .send_frame(&Frame::control_with(CTL_MSG_HANDSHAKE, hello.serialize()))
        .await?;

    let frame = reader.recv_frame().await?;
    if frame.proto_code != CTL_PROTO_CODE || frame.msg_code != CTL_MSG_HANDSHAKE {
        return Err(NetworkError::InvalidFrame(format!(
            "expected handshake frame, got proto {} msg {}",
            frame.proto_code, frame.msg_code
        )));
    }
    let remote = Hello::parse(&frame.payload)?;

    Ok(HelloExchange {
        local_nonce,
        remote,
    })
}

/// Per-connection protocol code tables produced by the handshake.
///
/// Immutable once built. `by_code` demultiplexes inbound frames,
/// `by_cap` multiplexes outbound sends.
#[derive(Debug, Clone, Default)]
pub struct CodeTables {
    /// protoCode -> capability, codes assigned from [`BASE_PROTO_CODE`].
    pub by_code: BTreeMap<u16, Capability>,
    /// capability string -> protoCode.
    pub by_cap: HashMap<String, u16>,
}

impl CodeTables {
    /// Capabilities in code order.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.by_code.values().cloned().collect()
    }
}

/// Derive the code tables from both endpoints' capability lists.
///
/// The common set is the intersection by (name, version), sorted by the
/// capability string so both endpoints assign identical codes.
pub fn negotiate(local: &[Capability], remote: &[Capability]) -> CodeTables {
    let mut common: Vec<&Capability> = local.iter().filter(|c| remote.contains(c)).collect();
    common.sort_by_key(|c| c.to_string());
    common.dedup();

    let mut tables = CodeTables::default();
    let mut code = BASE_PROTO_CODE;
    for cap in common {
        tables.by_code.insert(code, cap.clone());
        tables.by_cap.insert(cap.to_string(), code);
        code += 1;
    }
    tables
}

/// Derive 32 bytes of per-connection key material from both endpoints'
/// ids and nonces.
///
/// The pairs are ordered by node id before hashing, so the two endpoints
/// derive identical material. No cipher is applied here; this is the
/// extension point for an encrypted-transport layer.
pub fn session_secret(a_id: &NodeId, a_nonce: u32, b_id: &NodeId, b_nonce: u32) -> [u8; 32] {
    let (first, second) = if a_id.as_bytes() <= b_id.as_bytes() {
        ((a_id, a_nonce), (b_id, b_nonce))
    } else {
        ((b_id, b_nonce), (a_id, a_nonce))
    };

    let mut hasher = Blake2b::<U32>::new();
    hasher.update(first.0.as_bytes());
    hasher.update(first.1.to_be_bytes());
    hasher.update(second.0.as_bytes());
    hasher.update(second.1.to_be_bytes());

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}
