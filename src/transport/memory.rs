//! In-process transport.
//!
//! Every [`Transport::open`] on a [`MemoryTransport`] produces a fresh
//! [`MemoryPeer`] representing the far end of that link. Whoever holds the
//! peer plays the remote side: it sees every message the session sends and
//! decides what comes back, when, and whether the link dies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Endpoint;
use crate::envelope::{decode, encode, Envelope};
use crate::transport::{Link, Transport, TransportEvent, Wire};

/// Queue of peers, one per opened link.
pub type PeerQueue = mpsc::UnboundedReceiver<MemoryPeer>;

/// Transport whose links end in [`MemoryPeer`] handles.
#[derive(Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create the transport and the queue its peers are delivered on.
    pub fn new() -> (Self, PeerQueue) {
        let (peers, queue) = mpsc::unbounded_channel();
        let transport = Self {
            peers,
            refusing: Arc::new(AtomicBool::new(false)),
            opened: Arc::new(AtomicUsize::new(0)),
        };
        (transport, queue)
    }

    /// While set, every `open` fails with `connection refused`.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, refused ones included.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn open(&self, endpoint: &Endpoint) -> Link {
        self.opened.fetch_add(1, Ordering::SeqCst);

        if self.refusing.load(Ordering::SeqCst) {
            return Link::failed("connection refused");
        }

        let (link, wire) = Link::pair();
        wire.emit(TransportEvent::Open);

        let peer = MemoryPeer {
            endpoint: endpoint.clone(),
            wire,
        };
        if let Err(mpsc::error::SendError(peer)) = self.peers.send(peer) {
            peer.fail("no peer is listening");
        }

        link
    }
}

/// Remote end of one in-memory link.
pub struct MemoryPeer {
    endpoint: Endpoint,
    wire: Wire,
}

impl MemoryPeer {
    /// Endpoint the session asked for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Deliver raw bytes to the session; `false` once the link is gone.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.wire.emit(TransportEvent::Message(bytes.into()))
    }

    /// Encode and deliver an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match encode(envelope) {
            Ok(bytes) => self.send(bytes),
            Err(_) => false,
        }
    }

    /// Next message the session sent; `None` once the session dropped the link.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.wire.outbound.recv().await
    }

    /// Next message the session sent, decoded.
    ///
    /// Messages that fail to decode are skipped.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(bytes) = self.recv().await {
            if let Ok(envelope) = decode(&bytes) {
                return Some(envelope);
            }
        }
        None
    }

    /// A message already queued by the session, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.wire.outbound.try_recv().ok()
    }

    /// Whether the session has let go of this link.
    pub fn is_detached(&self) -> bool {
        self.wire.events.is_closed()
    }

    /// Close the link from the remote side.
    pub fn close(self, reason: impl Into<String>) {
        self.wire.emit(TransportEvent::Closed(reason.into()));
    }

    /// Fail the link from the remote side.
    pub fn fail(self, detail: impl Into<String>) {
        self.wire.emit(TransportEvent::Error(detail.into()));
    }
}
