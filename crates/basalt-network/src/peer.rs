//! Peer state and lifecycle.
//!
//! A `Peer` owns one handshaken connection: a single reader task, a
//! single pinger task, and a write lock serializing every outbound frame.
//! It moves through `Running -> Closing -> Closed`; the closed signal
//! fires exactly once and every send after it fails fast.

use crate::error::{NetworkError, NetworkResult};
use crate::frame::{Frame, FrameReader, FrameWriter};
use crate::handshake::{Capability, CodeTables};
use crate::message::{
    DisconnectReason, InboundMessage, CTL_MSG_DISC, CTL_MSG_PING, CTL_MSG_PONG, CTL_PROTO_CODE,
};
use crate::protocol::ProtocolHost;
use basalt_discovery::Node;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Runtime state for one connected remote.
pub struct Peer {
    node: Arc<Node>,
    created: Instant,
    ping_interval: Duration,
    secret: [u8; 32],
    tables: CodeTables,
    /// Every registered sub-protocol; receives added/removed events.
    announce: Vec<ProtocolHost>,
    /// protoCode -> host queue bundle, for inbound demultiplexing.
    /// Only capabilities both endpoints share appear here.
    hosts: HashMap<u16, ProtocolHost>,
    /// Write lock: every outbound frame goes through here.
    writer: Mutex<FrameWriter>,
    /// Taken once by `run`; reads never happen anywhere else.
    reader: SyncMutex<Option<FrameReader>>,
    disc_tx: mpsc::Sender<DisconnectReason>,
    disc_rx: SyncMutex<Option<mpsc::Receiver<DisconnectReason>>>,
    closed: CancellationToken,
    terminal: SyncMutex<Option<NetworkError>>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: Arc<Node>,
        reader: FrameReader,
        writer: FrameWriter,
        tables: CodeTables,
        announce: Vec<ProtocolHost>,
        hosts: HashMap<u16, ProtocolHost>,
        secret: [u8; 32],
        ping_interval: Duration,
    ) -> Arc<Self> {
        let (disc_tx, disc_rx) = mpsc::channel(1);
        Arc::new(Self {
            node,
            created: Instant::now(),
            ping_interval,
            secret,
            tables,
            announce,
            hosts,
            writer: Mutex::new(writer),
            reader: SyncMutex::new(Some(reader)),
            disc_tx,
            disc_rx: SyncMutex::new(Some(disc_rx)),
            closed: CancellationToken::new(),
            terminal: SyncMutex::new(None),
        })
    }

    /// Identity of the remote.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Monotonic creation time.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Capabilities negotiated on this connection, in code order.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.tables.capabilities()
    }

    /// Per-connection key material from the handshake nonces. Reserved
    /// for an encrypted-transport layer.
    pub fn session_secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Whether the closed signal has fired.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A token that fires when the peer closes.
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// The error that terminated the peer, once closed.
    pub fn terminal_error(&self) -> Option<String> {
        self.terminal.lock().as_ref().map(|e| e.to_string())
    }

    /// Send an application message on the given sub-protocol.
    ///
    /// Fails with [`NetworkError::UnknownProtocol`] when the capability
    /// was not negotiated on this connection; the peer stays connected.
    pub async fn send(&self, cap: &Capability, msg_code: u16, payload: Bytes) -> NetworkResult<()> {
        let code = self
            .tables
            .by_cap
            .get(&cap.to_string())
            .copied()
            .ok_or_else(|| NetworkError::UnknownProtocol(cap.to_string()))?;
        self.send_frame(&Frame::new(code, msg_code, payload)).await
    }

    /// Request a disconnect with the given reason.
    ///
    /// Non-blocking and idempotent; once the peer has closed (or a
    /// disconnect is already pending) the request is dropped silently.
    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.disc_tx.try_send(reason);
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> NetworkResult<()> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::PeerClosed);
        }
        let mut writer = self.writer.lock().await;
        if self.closed.is_cancelled() {
            return Err(NetworkError::PeerClosed);
        }
        writer.send_frame(frame).await
    }

    /// Close the connection without a run loop. Used when the server is
    /// already draining and the peer will never be admitted.
    pub(crate) async fn close_now(&self) {
        self.closed.cancel();
        self.writer.lock().await.shutdown().await;
    }

    /// Drive the peer to completion.
    ///
    /// Announces the peer to each registered sub-protocol, spawns the
    /// reader and pinger, waits for the first terminal event, then tears
    /// down: closed signal (exactly once), connection shutdown, worker
    /// join, removal announcements.
    pub(crate) async fn run(self: &Arc<Self>) {
        let reader = self.reader.lock().take();
        let disc_rx = self.disc_rx.lock().take();
        let (Some(reader), Some(mut disc_rx)) = (reader, disc_rx) else {
            warn!(peer = %self.node, "peer run called twice");
            return;
        };

        for host in &self.announce {
            host.peer_added(Arc::clone(self)).await;
        }

        let (err_tx, mut err_rx) = mpsc::channel::<NetworkError>(2);
        let read_task = tokio::spawn(read_loop(Arc::clone(self), reader, err_tx.clone()));
        let ping_task = tokio::spawn(ping_loop(Arc::clone(self), err_tx));

        let err = tokio::select! {
            Some(err) = err_rx.recv() => err,
            Some(reason) = disc_rx.recv() => {
                // Best-effort: let the remote observe the reason.
                self.send_disc(reason).await;
                NetworkError::DisconnectRequested(reason)
            }
        };

        self.closed.cancel();
        self.writer.lock().await.shutdown().await;
        let _ = read_task.await;
        let _ = ping_task.await;

        info!(peer = %self.node, err = %err, "peer closed");
        *self.terminal.lock() = Some(err);

        for host in &self.announce {
            host.peer_removed(Arc::clone(self)).await;
        }
    }

    async fn send_disc(&self, reason: DisconnectReason) {
        let frame = Frame::control_with(CTL_MSG_DISC, Bytes::copy_from_slice(&[reason.code()]));
        if let Err(err) = self.send_frame(&frame).await {
            debug!(peer = %self.node, %err, "disc frame not delivered");
        }
    }

    /// Route one received frame. Runs only on the reader task.
    async fn dispatch(self: &Arc<Self>, frame: Frame) -> NetworkResult<()> {
        if let Some(host) = self.hosts.get(&frame.proto_code) {
            let message = InboundMessage {
                msg_code: frame.msg_code,
                payload: frame.payload,
                received_at: Instant::now(),
                peer: Arc::clone(self),
            };
            let sender = host.inbound_sender();
            return tokio::select! {
                res = sender.send(message) => {
                    if res.is_err() {
                        trace!(peer = %self.node, "sub-protocol gone, message dropped");
                    }
                    Ok(())
                }
                // Closing while blocked on a full queue ends the stream.
                _ = self.closed.cancelled() => {
                    Err(NetworkError::Io(std::io::ErrorKind::UnexpectedEof.into()))
                }
            };
        }

        if frame.proto_code != CTL_PROTO_CODE {
            return Err(NetworkError::InvalidFrame(format!(
                "unknown protocol code {}",
                frame.proto_code
            )));
        }

        match frame.msg_code {
            CTL_MSG_PING => {
                let peer = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = peer.send_frame(&Frame::control(CTL_MSG_PONG)).await;
                });
                Ok(())
            }
            CTL_MSG_PONG => Ok(()),
            CTL_MSG_DISC => {
                let reason = frame
                    .payload
                    .first()
                    .copied()
                    .map(DisconnectReason::from_code)
                    .unwrap_or(DisconnectReason::Other(0));
                Err(NetworkError::RemoteDisconnect(reason))
            }
            other => {
                debug!(peer = %self.node, msg_code = other, "ignoring control message");
                Ok(())
            }
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("node", &self.node.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(peer: Arc<Peer>, mut reader: FrameReader, err_tx: mpsc::Sender<NetworkError>) {
    loop {
        let frame = tokio::select! {
            res = reader.recv_frame() => match res {
                Ok(frame) => frame,
                Err(err) => {
                    let _ = err_tx.send(err).await;
                    return;
                }
            },
            _ = peer.closed.cancelled() => return,
        };
        if let Err(err) = peer.dispatch(frame).await {
            let _ = err_tx.send(err).await;
            return;
        }
    }
}

async fn ping_loop(peer: Arc<Peer>, err_tx: mpsc::Sender<NetworkError>) {
    let start = tokio::time::Instant::now() + peer.ping_interval;
    let mut ticker = tokio::time::interval_at(start, peer.ping_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = peer.send_frame(&Frame::control(CTL_MSG_PING)).await {
                    if !matches!(err, NetworkError::PeerClosed) {
                        let _ = err_tx.send(err).await;
                    }
                    return;
                }
            }
            _ = peer.closed.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnConfig;
    use crate::frame::split_stream;
    use crate::handshake::negotiate;
    use crate::protocol::{protocol_channel, ProtocolEvents};
    use basalt_discovery::{NodeId, NODE_ID_LEN};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    fn test_node(byte: u8) -> Arc<Node> {
        Arc::new(Node::new(
            NodeId::from_bytes([byte; NODE_ID_LEN]),
            "127.0.0.1".parse().unwrap(),
            0,
        ))
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    /// A peer speaking the `tx/1` capability, plus the raw remote end of
    /// its connection and the protocol's application-side queues.
    async fn tx_peer() -> (Arc<Peer>, FrameReader, FrameWriter, ProtocolEvents) {
        let (local, remote) = socket_pair().await;
        let config = ConnConfig::default();
        let (reader, writer) = split_stream(local, &config);
        let (remote_reader, remote_writer) = split_stream(remote, &config);

        let caps = vec![Capability::new("tx", 1)];
        let tables = negotiate(&caps, &caps);
        let (host, events) = protocol_channel(Capability::new("tx", 1), 8);
        let mut hosts = HashMap::new();
        for (&code, _) in &tables.by_code {
            hosts.insert(code, host.clone());
        }

        let peer = Peer::new(
            test_node(2),
            reader,
            writer,
            tables,
            vec![host],
            hosts,
            [0u8; 32],
            Duration::from_secs(60),
        );
        (peer, remote_reader, remote_writer, events)
    }

    #[tokio::test]
    async fn test_added_precedes_inbound_precedes_removed() {
        let (peer, _remote_reader, mut remote_writer, mut events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        let added = timeout(Duration::from_secs(5), events.added.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&added, &peer));

        remote_writer
            .send_frame(&Frame::new(2, 7, Bytes::from_static(b"payload")))
            .await
            .unwrap();
        let message = timeout(Duration::from_secs(5), events.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.msg_code, 7);
        assert_eq!(&message.payload[..], b"payload");

        peer.disconnect(DisconnectReason::Requested);
        let removed = timeout(Duration::from_secs(5), events.removed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&removed, &peer));
        running.await.unwrap();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_local_disconnect_sends_reason_on_wire() {
        let (peer, mut remote_reader, _remote_writer, _events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        peer.disconnect(DisconnectReason::ServerQuit);

        let frame = timeout(Duration::from_secs(5), remote_reader.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.proto_code, CTL_PROTO_CODE);
        assert_eq!(frame.msg_code, CTL_MSG_DISC);
        assert_eq!(&frame.payload[..], &[DisconnectReason::ServerQuit.code()]);

        running.await.unwrap();
        let err = peer.terminal_error().unwrap();
        assert!(err.contains("disconnect requested"), "got {err}");
    }

    #[tokio::test]
    async fn test_remote_disc_terminates_peer() {
        let (peer, _remote_reader, mut remote_writer, _events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        remote_writer
            .send_frame(&Frame::control_with(
                CTL_MSG_DISC,
                Bytes::copy_from_slice(&[10]),
            ))
            .await
            .unwrap();

        running.await.unwrap();
        let err = peer.terminal_error().unwrap();
        assert!(err.contains("already connected"), "got {err}");
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (peer, mut remote_reader, mut remote_writer, _events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        remote_writer
            .send_frame(&Frame::control(CTL_MSG_PING))
            .await
            .unwrap();

        let frame = timeout(Duration::from_secs(5), remote_reader.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.proto_code, CTL_PROTO_CODE);
        assert_eq!(frame.msg_code, CTL_MSG_PONG);
        assert!(frame.payload.is_empty());

        peer.disconnect(DisconnectReason::Requested);
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_proto_code_terminates_peer() {
        let (peer, _remote_reader, mut remote_writer, _events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        remote_writer
            .send_frame(&Frame::new(99, 0, Bytes::new()))
            .await
            .unwrap();

        running.await.unwrap();
        let err = peer.terminal_error().unwrap();
        assert!(err.contains("invalid frame"), "got {err}");
    }

    #[tokio::test]
    async fn test_send_unknown_protocol_keeps_peer_alive() {
        let (peer, _remote_reader, _remote_writer, _events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };

        let err = peer
            .send(&Capability::new("light", 1), 0, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnknownProtocol(_)));
        assert!(!peer.is_closed());

        // A negotiated capability still works after the failed lookup.
        peer.send(&Capability::new("tx", 1), 3, Bytes::new())
            .await
            .unwrap();

        peer.disconnect(DisconnectReason::Requested);
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (peer, _remote_reader, _remote_writer, _events) = tx_peer().await;

        let running = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run().await })
        };
        peer.disconnect(DisconnectReason::Requested);
        running.await.unwrap();

        let err = peer
            .send(&Capability::new("tx", 1), 0, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PeerClosed));

        // Disconnect after close is dropped silently.
        peer.disconnect(DisconnectReason::Requested);
        peer.disconnect(DisconnectReason::Requested);
    }
}
