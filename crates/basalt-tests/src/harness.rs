//! Test harness for integration tests.
//!
//! Provides a server fixture with test-friendly timings, a raw
//! protocol-speaking client, and a sub-protocol probe that records events
//! in arrival order.

use basalt_discovery::{Node, NodeId, NODE_ID_LEN};
use basalt_network::{
    exchange, protocol_channel, split_stream, Capability, ConnConfig, Frame, FrameReader,
    FrameWriter, HelloExchange, NetworkResult, RegisteredProtocol, ServerConfig, CTL_MSG_DISC,
    CTL_MSG_PING, CTL_MSG_PONG, CTL_PROTO_CODE,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Deterministic node id from a single byte.
pub fn test_id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; NODE_ID_LEN])
}

/// A node record pointing at a real listener address.
pub fn test_node(byte: u8, addr: SocketAddr) -> Node {
    Node::new(test_id(byte), addr.ip(), addr.port())
}

/// Transport timeouts tight enough for tests but far from flaky.
pub fn test_conn_config() -> ConnConfig {
    ConnConfig {
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        ..ConnConfig::default()
    }
}

/// Server config on an ephemeral port with fast heartbeat and dial ticks.
pub fn test_server_config(local: u8) -> ServerConfig {
    ServerConfig {
        name: format!("test-{local:02x}"),
        local_id: test_id(local),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        kad_port: 0,
        ping_interval: Duration::from_millis(100),
        dial_timeout: Duration::from_secs(1),
        schedule_interval: Duration::from_millis(200),
        conn: test_conn_config(),
        ..ServerConfig::default()
    }
}

/// Poll until the condition holds or the deadline passes.
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F, deadline: Duration) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Everything a sub-protocol can observe, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Added(NodeId),
    Removed(NodeId),
    Message {
        from: NodeId,
        msg_code: u16,
        payload: Bytes,
    },
}

/// A sub-protocol that forwards its queue events into one ordered stream.
///
/// Peer handles are released immediately, as the host contract requires,
/// so the probe never keeps a departed peer alive.
pub fn probe_protocol(capability: Capability) -> (RegisteredProtocol, mpsc::UnboundedReceiver<ProbeEvent>) {
    let (host, mut events) = protocol_channel(capability, 16);
    let (probe_tx, probe_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                peer = events.added.recv() => match peer {
                    Some(peer) => {
                        let _ = probe_tx.send(ProbeEvent::Added(peer.node().id));
                    }
                    None => break,
                },
                message = events.inbound.recv() => match message {
                    Some(message) => {
                        let _ = probe_tx.send(ProbeEvent::Message {
                            from: message.peer.node().id,
                            msg_code: message.msg_code,
                            payload: message.payload,
                        });
                    }
                    None => break,
                },
                peer = events.removed.recv() => match peer {
                    Some(peer) => {
                        let _ = probe_tx.send(ProbeEvent::Removed(peer.node().id));
                    }
                    None => break,
                },
            }
        }
        // The queues close together; drain what is still buffered.
        while let Some(message) = events.inbound.recv().await {
            let _ = probe_tx.send(ProbeEvent::Message {
                from: message.peer.node().id,
                msg_code: message.msg_code,
                payload: message.payload,
            });
        }
        while let Some(peer) = events.removed.recv().await {
            let _ = probe_tx.send(ProbeEvent::Removed(peer.node().id));
        }
    });

    (RegisteredProtocol::new(host, task), probe_rx)
}

/// A raw client that speaks the wire protocol by hand.
pub struct TestClient {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    /// Outcome of the hello exchange; `hello.remote` is the server's hello.
    pub hello: HelloExchange,
    pub id: NodeId,
}

impl TestClient {
    /// Dial the server and complete the handshake.
    pub async fn connect(
        addr: SocketAddr,
        id: NodeId,
        capabilities: Vec<Capability>,
    ) -> NetworkResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = split_stream(stream, &test_conn_config());
        let hello = exchange(&mut reader, &mut writer, id, capabilities).await?;
        Ok(Self {
            reader,
            writer,
            hello,
            id,
        })
    }

    /// Send an application frame.
    pub async fn send(&mut self, proto_code: u16, msg_code: u16, payload: &[u8]) -> NetworkResult<()> {
        self.writer
            .send_frame(&Frame::new(
                proto_code,
                msg_code,
                Bytes::copy_from_slice(payload),
            ))
            .await
    }

    /// Read frames until a disc arrives, answering pings on the way.
    /// Returns the disc reason code, or None when the window elapses or
    /// the connection drops first.
    pub async fn read_until_disc(&mut self, window: Duration) -> Option<u8> {
        let end = Instant::now() + window;
        loop {
            let remaining = end.checked_duration_since(Instant::now())?;
            let frame = match timeout(remaining, self.reader.recv_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(_)) | Err(_) => return None,
            };
            if frame.proto_code != CTL_PROTO_CODE {
                continue;
            }
            match frame.msg_code {
                CTL_MSG_DISC => return frame.payload.first().copied(),
                CTL_MSG_PING => {
                    let _ = self.writer.send_frame(&Frame::control(CTL_MSG_PONG)).await;
                }
                _ => {}
            }
        }
    }

    /// Count heartbeat pings over the window, answering each with a pong.
    /// Also reports whether a disc frame showed up.
    pub async fn count_pings(&mut self, window: Duration) -> (usize, bool) {
        let end = Instant::now() + window;
        let mut pings = 0;
        let mut disced = false;
        loop {
            let Some(remaining) = end.checked_duration_since(Instant::now()) else {
                break;
            };
            let frame = match timeout(remaining, self.reader.recv_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(_)) | Err(_) => break,
            };
            if frame.proto_code != CTL_PROTO_CODE {
                continue;
            }
            match frame.msg_code {
                CTL_MSG_PING => {
                    pings += 1;
                    let _ = self.writer.send_frame(&Frame::control(CTL_MSG_PONG)).await;
                }
                CTL_MSG_DISC => {
                    disced = true;
                    break;
                }
                _ => {}
            }
        }
        (pings, disced)
    }
}
