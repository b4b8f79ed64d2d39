//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use basalt_discovery::{Node, NodeId};
use basalt_network::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete node configuration, loaded from TOML with CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub node_name: String,
    /// Hex-encoded local node id.
    pub my_node_id: String,
    /// TCP bind address for the P2P listener.
    pub listen_addr: String,
    /// UDP port handed to discovery.
    pub kad_port: u16,
    /// Inbound-handshake admission pool size (0 = default).
    #[serde(default)]
    pub max_pending_peers: usize,
    /// Pre-known nodes, as `<hex id>@<ip>:<tcp>[/<udp>]` strings.
    #[serde(default)]
    pub static_nodes: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "basalt-node".to_string(),
            my_node_id: String::new(),
            listen_addr: "0.0.0.0:9040".to_string(),
            kad_port: 9039,
            max_pending_peers: 0,
            static_nodes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("failed to read config file")?;
            toml::from_str(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        // Override with CLI args where explicitly provided.
        if let Some(ref name) = args.name {
            config.node_name = name.clone();
        }
        if let Some(ref node_id) = args.node_id {
            config.my_node_id = node_id.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(kad_port) = args.kad_port {
            config.kad_port = kad_port;
        }

        Ok(config)
    }

    /// Build the server configuration, parsing ids and node records.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let local_id: NodeId = self
            .my_node_id
            .parse()
            .context("my_node_id is not a valid hex node id")?;

        let mut static_nodes = Vec::with_capacity(self.static_nodes.len());
        for record in &self.static_nodes {
            let node: Node = record
                .parse()
                .with_context(|| format!("bad static node {record:?}"))?;
            static_nodes.push(node);
        }

        Ok(ServerConfig {
            name: self.node_name.clone(),
            local_id,
            listen_addr: self
                .listen_addr
                .parse()
                .context("listen_addr is not a valid socket address")?,
            kad_port: self.kad_port,
            max_pending_peers: self.max_pending_peers,
            static_nodes,
            ..ServerConfig::default()
        })
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
