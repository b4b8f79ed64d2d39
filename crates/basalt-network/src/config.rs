//! Server and connection configuration.

use basalt_discovery::{Node, NodeId};
use std::net::SocketAddr;
use std::time::Duration;

/// Default size of the inbound-handshake admission pool.
pub const DEFAULT_MAX_PENDING_PEERS: usize = 50;

/// Per-connection transport tunables.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Maximum time allowed for reading a complete frame.
    pub read_timeout: Duration,
    /// Maximum time allowed for writing a complete frame.
    pub write_timeout: Duration,
    /// Maximum frame payload size.
    pub max_payload: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(20),
            max_payload: 10 * 1024 * 1024, // 10 MiB
        }
    }
}

/// Server options.
///
/// Fields are fixed once the server starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Human-readable identity for log lines.
    pub name: String,
    /// Local node id advertised in the handshake. Must not be zero.
    pub local_id: NodeId,
    /// TCP bind address. Bind to port 0 to get an ephemeral port; the
    /// resolved address is observable through `Server::local_addr`.
    pub listen_addr: SocketAddr,
    /// UDP port handed to the discovery database.
    pub kad_port: u16,
    /// Size of the inbound-handshake admission pool. Zero selects
    /// [`DEFAULT_MAX_PENDING_PEERS`].
    pub max_pending_peers: usize,
    /// Pre-known nodes seeded into the discovery database.
    pub static_nodes: Vec<Node>,
    /// Heartbeat interval. Anything up to 15 s keeps peers comfortably
    /// inside the read deadline.
    pub ping_interval: Duration,
    /// Deadline for an outbound TCP connect.
    pub dial_timeout: Duration,
    /// Period of the dial-scheduling tick.
    pub schedule_interval: Duration,
    /// Transport tunables applied to every connection.
    pub conn: ConnConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "basalt".to_string(),
            local_id: NodeId::from_bytes([0u8; basalt_discovery::NODE_ID_LEN]),
            listen_addr: "0.0.0.0:9040".parse().expect("valid default listen addr"),
            kad_port: 9039,
            max_pending_peers: 0,
            static_nodes: Vec::new(),
            ping_interval: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(15),
            schedule_interval: Duration::from_secs(10),
            conn: ConnConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Admission pool size with the zero-means-default rule applied.
    pub fn pending_peer_slots(&self) -> usize {
        if self.max_pending_peers == 0 {
            DEFAULT_MAX_PENDING_PEERS
        } else {
            self.max_pending_peers
        }
    }
}
