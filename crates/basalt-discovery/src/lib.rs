//! # basalt-discovery
//!
//! Node identity and the discovery-side node database.
//!
//! The networking core treats discovery as an opaque collaborator: it asks
//! for a point-in-time snapshot of the known-node table and dials from
//! that. This crate provides the `NodeId` / `Node` types and a `Database`
//! seeded from statically configured nodes. A Kademlia transport can feed
//! the same table through [`Database::insert`] without the core noticing.

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Length of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Errors from parsing node identities and node records.
#[derive(Error, Debug)]
pub enum NodeParseError {
    /// Identifier is not valid hex.
    #[error("invalid hex in node id: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Identifier has the wrong length.
    #[error("node id must be {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// Node record string is malformed.
    #[error("invalid node record: {0}")]
    InvalidRecord(String),
}

/// Fixed-width opaque identifier of a network participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Wrap raw bytes as a node id.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// An all-zero id is never a valid participant.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Shortened hex form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        let got = bytes.len();
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeParseError::InvalidLength {
                expected: NODE_ID_LEN,
                got,
            })?;
        Ok(Self(arr))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable identity of a remote participant.
///
/// The TCP port is the dial target for the P2P transport; the UDP port is
/// what the discovery transport itself listens on. The two are distinct on
/// purpose and must never be swapped when dialing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, the key in the peer map.
    pub id: NodeId,
    /// IP address.
    pub ip: IpAddr,
    /// TCP port the node accepts P2P connections on.
    pub tcp_port: u16,
    /// UDP port of the node's discovery endpoint.
    #[serde(default)]
    pub udp_port: u16,
}

impl Node {
    /// Create a node record; the UDP port defaults to the TCP port.
    pub fn new(id: NodeId, ip: IpAddr, tcp_port: u16) -> Self {
        Self {
            id,
            ip,
            tcp_port,
            udp_port: tcp_port,
        }
    }

    /// Address to dial for a P2P connection.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Address of the discovery endpoint.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.tcp_addr())
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    /// Parses `<hex id>@<ip>:<tcp port>[/<udp port>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id_part, addr_part) = s
            .split_once('@')
            .ok_or_else(|| NodeParseError::InvalidRecord(format!("missing '@' in {s:?}")))?;
        let id: NodeId = id_part.parse()?;

        let (tcp_part, udp_part) = match addr_part.split_once('/') {
            Some((tcp, udp)) => (tcp, Some(udp)),
            None => (addr_part, None),
        };
        let tcp_addr: SocketAddr = tcp_part
            .parse()
            .map_err(|e| NodeParseError::InvalidRecord(format!("bad address {tcp_part:?}: {e}")))?;

        let udp_port = match udp_part {
            Some(p) => p
                .parse()
                .map_err(|e| NodeParseError::InvalidRecord(format!("bad udp port {p:?}: {e}")))?,
            None => tcp_addr.port(),
        };

        Ok(Self {
            id,
            ip: tcp_addr.ip(),
            tcp_port: tcp_addr.port(),
            udp_port,
        })
    }
}

/// The known-node table.
///
/// Single source of dial candidates for the networking core. The core only
/// ever reads point-in-time copies via [`Database::snapshot`]; writers are
/// the static-node seed at startup and whatever discovery transport feeds
/// [`Database::insert`].
pub struct Database {
    local_id: NodeId,
    kad_port: u16,
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    running: AtomicBool,
}

impl Database {
    /// Start the discovery database, seeded with the static nodes.
    ///
    /// `kad_port` is the UDP port a discovery transport would bind; it is
    /// recorded here so the lifecycle matches the server's start/stop.
    pub fn start(kad_port: u16, local_id: NodeId, static_nodes: &[Node]) -> Arc<Self> {
        let db = Arc::new(Self {
            local_id,
            kad_port,
            nodes: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
        });
        for node in static_nodes {
            db.insert(node.clone());
        }
        info!(
            kad_port,
            seeded = db.len(),
            local = %local_id.short(),
            "discovery database started"
        );
        db
    }

    /// Add a node to the table. Records for the local node or with a zero
    /// id are ignored.
    pub fn insert(&self, node: Node) {
        if node.id == self.local_id || node.id.is_zero() {
            return;
        }
        debug!(node = %node, "discovery insert");
        self.nodes.write().insert(node.id, Arc::new(node));
    }

    /// Point-in-time copy of the known-node table.
    pub fn snapshot(&self) -> HashMap<NodeId, Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// UDP port handed to the discovery transport.
    pub fn kad_port(&self) -> u16 {
        self.kad_port
    }

    /// Stop the discovery lifecycle.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("discovery database stopped");
        }
    }

    /// Whether the database is between start and stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
