//! Sub-protocol host interface.
//!
//! A sub-protocol registers once at server start and runs its own task.
//! The host side delivers three bounded queues: peer-added, peer-removed,
//! and inbound messages. For any peer, added strictly precedes its
//! messages, which strictly precede removed. The queues close when the
//! server drops the host senders during shutdown, after the peer map has
//! drained; the sub-protocol task then sees end-of-stream and exits, and
//! the server joins it.

use crate::handshake::Capability;
use crate::message::InboundMessage;
use crate::peer::Peer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default depth of each sub-protocol queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Host-side handle for one registered sub-protocol.
///
/// Cloned into every peer: all peers announce added/removed here, and
/// peers that negotiated the capability also route inbound messages
/// through `inbound`.
#[derive(Debug, Clone)]
pub struct ProtocolHost {
    capability: Capability,
    added_tx: mpsc::Sender<Arc<Peer>>,
    removed_tx: mpsc::Sender<Arc<Peer>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl ProtocolHost {
    /// The capability this sub-protocol advertises.
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub(crate) async fn peer_added(&self, peer: Arc<Peer>) {
        // A closed queue means the sub-protocol task already exited;
        // the peer keeps running without it.
        let _ = self.added_tx.send(peer).await;
    }

    pub(crate) async fn peer_removed(&self, peer: Arc<Peer>) {
        let _ = self.removed_tx.send(peer).await;
    }

    pub(crate) fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }
}

/// Application-side queue ends for one sub-protocol.
pub struct ProtocolEvents {
    /// A peer completed handshake and was admitted.
    pub added: mpsc::Receiver<Arc<Peer>>,
    /// The peer departed. Always after its added event.
    pub removed: mpsc::Receiver<Arc<Peer>>,
    /// Messages addressed to this sub-protocol, in per-peer wire order.
    pub inbound: mpsc::Receiver<InboundMessage>,
}

/// Create the queue pair for a sub-protocol.
pub fn protocol_channel(capability: Capability, capacity: usize) -> (ProtocolHost, ProtocolEvents) {
    let (added_tx, added) = mpsc::channel(capacity);
    let (removed_tx, removed) = mpsc::channel(capacity);
    let (inbound_tx, inbound) = mpsc::channel(capacity);
    (
        ProtocolHost {
            capability,
            added_tx,
            removed_tx,
            inbound_tx,
        },
        ProtocolEvents {
            added,
            removed,
            inbound,
        },
    )
}

/// A sub-protocol handed to the server: its host queues plus the handle
/// of the task draining them, joined on shutdown.
pub struct RegisteredProtocol {
    pub(crate) host: ProtocolHost,
    pub(crate) task: JoinHandle<()>,
}

impl RegisteredProtocol {
    /// Pair a protocol's host side with its running task.
    pub fn new(host: ProtocolHost, task: JoinHandle<()>) -> Self {
        Self { host, task }
    }

    /// The capability this sub-protocol advertises.
    pub fn capability(&self) -> &Capability {
        self.host.capability()
    }
}
