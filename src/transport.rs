//! Transport adapters for the bridge.
//!
//! A transport owns one full-duplex message connection at a time and knows
//! nothing about envelopes: it moves opaque byte messages and reports what
//! happened to the link.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   outbound bytes    ┌──────────────────────┐
//! │     Session     │ ──────────────────► │  transport task(s)   │ ◄──► socket
//! │ (driver task)   │ ◄────────────────── │  (framing, I/O)      │
//! └─────────────────┘   TransportEvent    └──────────────────────┘
//! ```
//!
//! `open` returns immediately with a [`Link`]; the connection attempt runs in
//! the background and reports [`TransportEvent::Open`] once usable.
//! [`TransportEvent::Closed`] and [`TransportEvent::Error`] end the link, as
//! does the event channel closing. Reconnecting is the session's job.
//!
//! # Implementations
//!
//! - [`stream::StreamConnector`] dials TCP or Unix sockets.
//! - [`stream::StreamAcceptor`] listens and hands out accepted peers.
//! - [`memory::MemoryTransport`] keeps everything in process.

pub mod framing;
pub mod memory;
pub mod stream;

use tokio::sync::mpsc;

use crate::config::Endpoint;
use crate::error::BridgeError;

pub use memory::{MemoryPeer, MemoryTransport};
pub use stream::{StreamAcceptor, StreamConnector};

/// Something that happened to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and can carry messages.
    Open,
    /// One complete message arrived.
    Message(Vec<u8>),
    /// The peer or the transport closed the link.
    Closed(String),
    /// The link failed.
    Error(String),
}

impl TransportEvent {
    /// Whether the link is finished after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Closed(_) | TransportEvent::Error(_))
    }
}

/// Opens links to a remote endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `endpoint`.
    ///
    /// Must be called from within a tokio runtime.
    fn open(&self, endpoint: &Endpoint) -> Link;
}

/// Session side of one connection attempt.
pub struct Link {
    outbound: LinkSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport side of a [`Link`].
pub struct Wire {
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl Wire {
    /// Report an event; returns `false` once the session has let go.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

impl Link {
    /// Create a connected link/wire pair.
    pub fn pair() -> (Link, Wire) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let link = Link {
            outbound: LinkSender(outbound_tx),
            events: events_rx,
        };
        let wire = Wire {
            outbound: outbound_rx,
            events: events_tx,
        };

        (link, wire)
    }

    /// A link that failed before it started.
    pub fn failed(detail: impl Into<String>) -> Link {
        let (link, wire) = Link::pair();
        wire.emit(TransportEvent::Error(detail.into()));
        link
    }

    /// Handle for sending on this link from other tasks.
    pub fn sender(&self) -> LinkSender {
        self.outbound.clone()
    }

    /// Next event; a closed event channel is reported as `Closed`.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed("transport dropped the link".to_string()))
    }
}

/// Cloneable sending half of a [`Link`].
#[derive(Clone)]
pub struct LinkSender(mpsc::UnboundedSender<Vec<u8>>);

impl LinkSender {
    /// Queue one message for delivery.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), BridgeError> {
        self.0.send(bytes).map_err(|_| BridgeError::NotConnected)
    }

    /// Whether both senders feed the same link.
    pub fn same_link(&self, other: &LinkSender) -> bool {
        self.0.same_channel(&other.0)
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}
