//! The P2P server: acceptor, dialer, and the reconciliation loop.
//!
//! The reconciliation task is the single owner of the peer map. Admission
//! and departure arrive as events on channels; nothing else ever touches
//! the map, which is what guarantees at most one peer per node id without
//! cross-task locking. The acceptor gates inbound handshakes behind an
//! admission-token pool, and the dialer works off point-in-time discovery
//! snapshots on a periodic tick.

use crate::config::ServerConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::frame::split_stream;
use crate::handshake::{self, negotiate, session_secret, Capability};
use crate::message::DisconnectReason;
use crate::peer::Peer;
use crate::protocol::{ProtocolHost, RegisteredProtocol};
use basalt_discovery::{Database, Node, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Depth of the add-peer and del-peer event channels.
const PEER_EVENT_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

enum ServerState {
    Idle,
    Starting,
    Running(Running),
}

struct Running {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    recon: JoinHandle<()>,
    local_addr: SocketAddr,
    kad_db: Arc<Database>,
}

/// Shared context handed to the server's tasks.
struct ServerCtx {
    config: ServerConfig,
    capabilities: Vec<Capability>,
    hosts: Vec<ProtocolHost>,
    kad_db: Arc<Database>,
    add_tx: mpsc::Sender<Arc<Peer>>,
    del_tx: mpsc::Sender<Arc<Peer>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    peer_count: Arc<AtomicUsize>,
}

/// Manages all P2P peer connections.
pub struct Server {
    config: ServerConfig,
    protocols: Mutex<Vec<RegisteredProtocol>>,
    state: Mutex<ServerState>,
    peer_count: Arc<AtomicUsize>,
}

impl Server {
    /// Create a server. Register sub-protocols, then call [`Server::start`].
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            protocols: Mutex::new(Vec::new()),
            state: Mutex::new(ServerState::Idle),
            peer_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a sub-protocol. Must happen before start; each capability
    /// may be registered once.
    pub fn register_protocol(&self, protocol: RegisteredProtocol) -> NetworkResult<()> {
        if !matches!(*self.state.lock(), ServerState::Idle) {
            return Err(NetworkError::AlreadyRunning);
        }
        let mut protocols = self.protocols.lock();
        if protocols
            .iter()
            .any(|p| p.capability() == protocol.capability())
        {
            return Err(NetworkError::Config(format!(
                "capability {} registered twice",
                protocol.capability()
            )));
        }
        protocols.push(protocol);
        Ok(())
    }

    /// Start the server: discovery, listener, acceptor, dialer, and the
    /// reconciliation task.
    pub async fn start(&self) -> NetworkResult<()> {
        if self.config.local_id.is_zero() {
            return Err(NetworkError::Config("local node id must not be zero".into()));
        }

        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Idle => *state = ServerState::Starting,
                _ => return Err(NetworkError::AlreadyRunning),
            }
        }

        match self.start_inner().await {
            Ok(running) => {
                *self.state.lock() = ServerState::Running(running);
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = ServerState::Idle;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> NetworkResult<Running> {
        let protocols: Vec<RegisteredProtocol> = std::mem::take(&mut *self.protocols.lock());
        let capabilities: Vec<Capability> =
            protocols.iter().map(|p| p.capability().clone()).collect();
        let hosts: Vec<ProtocolHost> = protocols.iter().map(|p| p.host.clone()).collect();

        let kad_db = Database::start(
            self.config.kad_port,
            self.config.local_id,
            &self.config.static_nodes,
        );

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            name = %self.config.name,
            %local_addr,
            capabilities = capabilities.len(),
            "p2p server listening"
        );

        let (add_tx, add_rx) = mpsc::channel(PEER_EVENT_QUEUE);
        let (del_tx, del_rx) = mpsc::channel(PEER_EVENT_QUEUE);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        self.peer_count.store(0, Ordering::Relaxed);

        let ctx = Arc::new(ServerCtx {
            config: self.config.clone(),
            capabilities,
            hosts,
            kad_db: Arc::clone(&kad_db),
            add_tx,
            del_tx,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            peer_count: Arc::clone(&self.peer_count),
        });

        tracker.spawn(listen_loop(listener, Arc::clone(&ctx)));
        let recon = tokio::spawn(reconcile_loop(ctx, add_rx, del_rx, protocols));

        Ok(Running {
            shutdown,
            tracker,
            recon,
            local_addr,
            kad_db,
        })
    }

    /// Stop the server and wait until every task has joined and every
    /// connection is closed. A no-op when the server is not running.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ServerState::Idle) {
                ServerState::Running(running) => running,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        info!(name = %self.config.name, "p2p server stopping");
        running.shutdown.cancel();
        running.tracker.close();
        running.tracker.wait().await;
        let _ = running.recon.await;
        running.kad_db.stop();
        info!(name = %self.config.name, "p2p server stopped");
    }

    /// The resolved listen address, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            ServerState::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// The discovery database, once running.
    pub fn discovery(&self) -> Option<Arc<Database>> {
        match &*self.state.lock() {
            ServerState::Running(running) => Some(Arc::clone(&running.kad_db)),
            _ => None,
        }
    }

    /// Number of admitted peers, sampled from the reconciliation task.
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    /// Whether the server is between start and stop.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ServerState::Running(_))
    }
}

/// Accept loop. One admission token is consumed per inbound connection
/// and returned when its handshake task completes, so at most
/// `max_pending_peers` inbound handshakes run concurrently.
async fn listen_loop(listener: TcpListener, ctx: Arc<ServerCtx>) {
    let slots = Arc::new(Semaphore::new(ctx.config.pending_peer_slots()));

    loop {
        // Wait for a handshake slot before accepting.
        let permit = tokio::select! {
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = ctx.shutdown.cancelled() => return,
        };

        let (stream, addr) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) if is_temporary(&err) => {
                    warn!(%err, "temporary accept error, retrying");
                    continue;
                }
                Err(err) => {
                    error!(%err, "listener failed");
                    return;
                }
            },
            _ = ctx.shutdown.cancelled() => return,
        };

        debug!(%addr, "inbound connection");
        let ctx = Arc::clone(&ctx);
        ctx.tracker.clone().spawn(async move {
            let _permit = permit;
            setup_conn(stream, Direction::Inbound, None, ctx).await;
        });
    }
}

fn is_temporary(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Handshake a fresh connection and, on success, hand the peer to the
/// reconciliation task and drive it to completion. A handshake failure
/// closes the connection and admits nothing.
async fn setup_conn(
    stream: TcpStream,
    direction: Direction,
    dial_dest: Option<Arc<Node>>,
    ctx: Arc<ServerCtx>,
) {
    let addr = stream.peer_addr().ok();
    let peer = match handshake_conn(stream, direction, dial_dest, &ctx).await {
        Ok(peer) => peer,
        Err(err) => {
            debug!(?addr, ?direction, %err, "handshake failed");
            return;
        }
    };

    if ctx.add_tx.send(Arc::clone(&peer)).await.is_err() {
        // Reconciliation has already shut down; never admitted.
        peer.close_now().await;
        return;
    }
    peer.run().await;
    let _ = ctx.del_tx.send(peer).await;
}

async fn handshake_conn(
    stream: TcpStream,
    direction: Direction,
    dial_dest: Option<Arc<Node>>,
    ctx: &ServerCtx,
) -> NetworkResult<Arc<Peer>> {
    let (mut reader, mut writer) = split_stream(stream, &ctx.config.conn);
    let hello = handshake::exchange(
        &mut reader,
        &mut writer,
        ctx.config.local_id,
        ctx.capabilities.clone(),
    )
    .await?;
    let remote = &hello.remote;

    let node = match (direction, dial_dest) {
        (Direction::Outbound, Some(node)) => {
            if remote.node_id != node.id {
                return Err(NetworkError::HandshakeFailed(format!(
                    "dialed {} but remote identified as {}",
                    node.id.short(),
                    remote.node_id.short()
                )));
            }
            node
        }
        _ => {
            // Inbound: the remote must already be known to discovery.
            ctx.kad_db
                .snapshot()
                .get(&remote.node_id)
                .cloned()
                .ok_or(NetworkError::UnknownPeer(remote.node_id))?
        }
    };

    let tables = negotiate(&ctx.capabilities, &remote.capabilities);
    let mut hosts = HashMap::new();
    for (&code, cap) in &tables.by_code {
        if let Some(host) = ctx.hosts.iter().find(|h| h.capability() == cap) {
            hosts.insert(code, host.clone());
        }
    }
    let secret = session_secret(
        &ctx.config.local_id,
        hello.local_nonce,
        &remote.node_id,
        remote.nonce,
    );

    info!(
        node = %node,
        ?direction,
        capabilities = %tables
            .capabilities()
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(","),
        "handshake complete"
    );

    Ok(Peer::new(
        node,
        reader,
        writer,
        tables,
        ctx.hosts.clone(),
        hosts,
        secret,
        ctx.config.ping_interval,
    ))
}

/// The reconciliation task: sole owner of the peer map.
async fn reconcile_loop(
    ctx: Arc<ServerCtx>,
    mut add_rx: mpsc::Receiver<Arc<Peer>>,
    mut del_rx: mpsc::Receiver<Arc<Peer>>,
    protocols: Vec<RegisteredProtocol>,
) {
    let mut peers: HashMap<NodeId, Arc<Peer>> = HashMap::new();
    let mut ticker = tokio::time::interval(ctx.config.schedule_interval);

    loop {
        tokio::select! {
            biased;

            _ = ctx.shutdown.cancelled() => break,

            Some(peer) = del_rx.recv() => {
                remove_if_same(&mut peers, &peer);
                ctx.peer_count.store(peers.len(), Ordering::Relaxed);
            }

            Some(peer) = add_rx.recv() => {
                let id = peer.node().id;
                if peers.contains_key(&id) {
                    info!(peer = %peer, "node already connected, rejecting");
                    peer.disconnect(DisconnectReason::AlreadyConnected);
                } else {
                    peers.insert(id, peer);
                    ctx.peer_count.store(peers.len(), Ordering::Relaxed);
                    info!(total = peers.len(), "peer admitted");
                }
            }

            _ = ticker.tick() => schedule_dials(&ctx, &peers),
        }
    }

    // Drain mode: every peer gets a server-quit disconnect, then the map
    // empties through the usual removal events.
    info!(peers = peers.len(), "reconciliation draining");
    for peer in peers.values() {
        peer.disconnect(DisconnectReason::ServerQuit);
    }
    while !peers.is_empty() {
        tokio::select! {
            Some(peer) = del_rx.recv() => {
                remove_if_same(&mut peers, &peer);
            }
            Some(peer) = add_rx.recv() => {
                // Late handshake completion during drain.
                peer.disconnect(DisconnectReason::ServerQuit);
            }
        }
    }
    ctx.peer_count.store(0, Ordering::Relaxed);

    // Closing the event channels lets in-flight handshake tasks fail
    // their sends and finish; dropping the context releases this task's
    // protocol queue senders. Once every holder is gone the queues close
    // and the sub-protocol tasks drain out.
    drop(add_rx);
    drop(del_rx);
    drop(ctx);
    for protocol in protocols {
        let cap = protocol.capability().clone();
        if protocol.task.await.is_err() {
            warn!(capability = %cap, "sub-protocol task panicked");
        }
    }
}

/// Remove the departed peer iff the mapped entry is the same instance,
/// so a stale removal from a replaced peer cannot evict its successor.
fn remove_if_same(peers: &mut HashMap<NodeId, Arc<Peer>>, departed: &Arc<Peer>) {
    let id = departed.node().id;
    match peers.get(&id) {
        Some(current) if Arc::ptr_eq(current, departed) => {
            peers.remove(&id);
            info!(peer = %departed, total = peers.len(), "peer removed");
        }
        _ => {
            debug!(peer = %departed, "removal for unmapped peer ignored");
        }
    }
}

/// One dial-scheduling tick: snapshot discovery, skip connected nodes,
/// dial the rest. Failures are dropped; the next tick retries.
fn schedule_dials(ctx: &Arc<ServerCtx>, peers: &HashMap<NodeId, Arc<Peer>>) {
    if ctx.shutdown.is_cancelled() {
        return;
    }
    let snapshot = ctx.kad_db.snapshot();
    debug!(known = snapshot.len(), connected = peers.len(), "dial tick");

    for (id, node) in snapshot {
        if id == ctx.config.local_id || peers.contains_key(&id) {
            continue;
        }
        let ctx = Arc::clone(ctx);
        ctx.tracker.clone().spawn(dial(node, ctx));
    }
}

async fn dial(node: Arc<Node>, ctx: Arc<ServerCtx>) {
    // Always the node's TCP port; the UDP port belongs to discovery.
    let addr = node.tcp_addr();
    let dial_timeout = ctx.config.dial_timeout;
    let connected = tokio::select! {
        res = tokio::time::timeout(dial_timeout, TcpStream::connect(addr)) => Some(res),
        _ = ctx.shutdown.cancelled() => None,
    };
    match connected {
        Some(Ok(Ok(stream))) => setup_conn(stream, Direction::Outbound, Some(node), ctx).await,
        Some(Ok(Err(err))) => debug!(%addr, %err, "dial failed"),
        Some(Err(_)) => debug!(%addr, "dial timed out"),
        None => {}
    }
}
