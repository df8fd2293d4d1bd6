//! RPC session over one transport.
//!
//! A [`Session`] owns the connection lifecycle, multiplexes outbound calls
//! over the current link and serves inbound requests from its
//! [`RouteTable`]. It is a cheap-to-clone handle; all clones drive the same
//! connection.
//!
//! # State machine
//!
//! ```text
//!            start()
//!   Closed ──────────► Connecting ──Open──► Open
//!     ▲  ▲                 │                  │
//!     │  └── attempt fails ┘                  │ link closed / failed
//!     │                                       ▼ (pending calls drained)
//!     └──── reconnect delay ◄──────────── Closed
//! ```
//!
//! `stop()` moves through `Closing` to `Closed` and never reconnects.
//!
//! # Example
//!
//! ```no_run
//! use scriptbridge::config::BridgeConfig;
//! use scriptbridge::session::{ConnectionState, Session};
//! use scriptbridge::transport::StreamConnector;
//! use serde_json::Value;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(BridgeConfig::default(), StreamConnector::new());
//! session.start();
//! session.wait_for_state(ConnectionState::Open).await;
//!
//! let status = session.call("ping", Value::Null).await?;
//! println!("{}", status);
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::envelope::{decode, encode, CorrelationId, Envelope};
use crate::error::BridgeError;
use crate::registry::{PendingCalls, PendingReply};
use crate::routes::{HandlerResult, RouteTable};
use crate::transport::{Link, LinkSender, Transport, TransportEvent};

/// Lifecycle of the session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Calls currently awaiting a result.
    pub pending: usize,
    /// Responses for calls that had already settled.
    pub late_responses: u64,
    /// Responses for ids this session never issued.
    pub unmatched_responses: u64,
    /// Inbound messages dropped because they did not decode.
    pub decode_failures: u64,
    /// Reconnect attempts scheduled after a drop or failed attempt.
    pub reconnect_attempts: u64,
    /// Times the connection reached `Open`.
    pub connections: u64,
}

/// Per-call options for [`Session::invoke_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
    /// Ask the peer to echo the `debug` flag on its response.
    pub debug: bool,
}

struct Driver {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct SessionInner {
    config: BridgeConfig,
    transport: Box<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    /// Whether the driver task is alive.
    running: watch::Sender<bool>,
    /// Sender for the link that is currently `Open`.
    outbound: Mutex<Option<LinkSender>>,
    pending: Arc<PendingCalls>,
    routes: RouteTable,
    driver: Mutex<Option<Driver>>,
    decode_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    connections: AtomicU64,
}

/// Handle to one bridge connection.
///
/// Dropping the last handle stops the session as [`stop`](Self::stop)
/// would, without waiting for the driver to finish.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    _owner: Arc<Owner>,
}

/// Shared by all handles of one session; internal tasks never hold it.
struct Owner(Weak<SessionInner>);

impl Drop for Owner {
    fn drop(&mut self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let driver = lock(&inner.driver).take();
        if let Some(driver) = driver {
            debug!("Last handle for {} dropped", inner.config.address);
            let _ = driver.stop.send(());
        }
    }
}

impl Session {
    /// Build a session. Nothing happens until [`start`](Self::start).
    pub fn new<T: Transport>(config: BridgeConfig, transport: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (running, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            config,
            transport: Box::new(transport),
            state,
            running,
            outbound: Mutex::new(None),
            pending: Arc::new(PendingCalls::new()),
            routes: RouteTable::new(),
            driver: Mutex::new(None),
            decode_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        });
        let owner = Arc::new(Owner(Arc::downgrade(&inner)));
        Self {
            inner,
            _owner: owner,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Begin connecting. Does nothing if the session is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut driver = lock(&self.inner.driver);
        if driver.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            debug!("Session for {} already running", self.inner.config.address);
            return;
        }

        info!("Starting session for {}", self.inner.config.address);
        let (stop_tx, stop_rx) = oneshot::channel();
        self.inner.running.send_replace(true);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            Arc::clone(&inner).drive(stop_rx).await;
            inner.running.send_replace(false);
        });
        *driver = Some(Driver {
            stop: stop_tx,
            handle,
        });
    }

    /// Close the connection for good.
    ///
    /// Pending calls settle with `ConnectionLost("session stopped")`. The
    /// session stays `Closed` until started again.
    pub async fn stop(&self) {
        let driver = lock(&self.inner.driver).take();
        if driver.is_none() && self.state() == ConnectionState::Closed {
            return;
        }

        self.inner.set_state(ConnectionState::Closing);
        if let Some(driver) = driver {
            let _ = driver.stop.send(());
            let _ = driver.handle.await;
        }

        self.inner
            .detach(BridgeError::ConnectionLost("session stopped".to_string()));
        info!("Session for {} stopped", self.inner.config.address);
    }

    /// Call `procedure` on the peer with the default timeout.
    pub async fn call(&self, procedure: &str, payload: Value) -> Result<Value, BridgeError> {
        self.invoke(procedure, payload)?.await
    }

    /// Call `procedure` on the peer, giving up after `timeout`.
    pub async fn call_with_timeout(
        &self,
        procedure: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let options = CallOptions {
            timeout: Some(timeout),
            ..CallOptions::default()
        };
        self.invoke_with(procedure, payload, options)?.await
    }

    /// Send a request and return its reply future without awaiting it.
    ///
    /// The reply's [`id`](PendingReply::id) can be passed to
    /// [`cancel`](Self::cancel).
    pub fn invoke(&self, procedure: &str, payload: Value) -> Result<PendingReply, BridgeError> {
        self.invoke_with(procedure, payload, CallOptions::default())
    }

    /// [`invoke`](Self::invoke) with explicit options.
    ///
    /// Fails immediately with [`BridgeError::NotConnected`] unless the
    /// connection is `Open`; calls are never queued.
    pub fn invoke_with(
        &self,
        procedure: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<PendingReply, BridgeError> {
        if self.state() != ConnectionState::Open {
            return Err(BridgeError::NotConnected);
        }

        let inner = &self.inner;
        let timeout = options.timeout.unwrap_or_else(|| inner.config.call_timeout());
        let (id, reply) = inner.pending.register(procedure, timeout);

        let envelope = Envelope::request(id, procedure, payload).with_debug(options.debug);
        if let Err(e) = inner.send_current(&envelope) {
            inner.pending.fail(id, e.clone());
            return Err(e);
        }

        debug!("-> request {} {}", id, procedure);
        Ok(reply)
    }

    /// Give up on an outstanding call as if it had timed out.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.inner.pending.cancel(id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Whether the session is connecting, connected, or waiting to reconnect.
    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Wait until the session has stopped trying: after `stop()`, or once
    /// the reconnect policy gives up. Returns at once if not running.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.inner.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Routes served to the peer.
    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    /// Shorthand for `routes().register_route(..)`.
    pub fn register_route<F, Fut>(&self, procedure: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.routes.register_route(procedure, handler);
    }

    pub fn stats(&self) -> SessionStats {
        let inner = &self.inner;
        let registry = inner.pending.stats();
        SessionStats {
            pending: inner.pending.len(),
            late_responses: registry.late_responses,
            unmatched_responses: registry.unmatched_responses,
            decode_failures: inner.decode_failures.load(Ordering::Relaxed),
            reconnect_attempts: inner.reconnect_attempts.load(Ordering::Relaxed),
            connections: inner.connections.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Connection to {} is {}", self.config.address, next);
        }
    }

    /// Drop the current link and settle everything that was waiting on it.
    fn detach(&self, error: BridgeError) {
        // Clearing the sender first means a call racing with us either fails
        // to send or gets drained below.
        lock(&self.outbound).take();
        self.set_state(ConnectionState::Closed);
        self.pending.drain_all(error);
    }

    fn send_current(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let bytes = encode(envelope)?;
        let sender = lock(&self.outbound).clone();
        match sender {
            Some(sender) => sender.send(bytes),
            None => Err(BridgeError::NotConnected),
        }
    }

    /// Send on `link` only if it is still the current link.
    fn send_on(&self, link: &LinkSender, envelope: &Envelope) -> Result<(), BridgeError> {
        let bytes = encode(envelope)?;
        let current = lock(&self.outbound).clone();
        match current {
            Some(current) if current.same_link(link) => current.send(bytes),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Connection loop: connect, serve, and reconnect per policy.
    async fn drive(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            let mut link = self.transport.open(&self.config.address);

            let (was_open, reason) = tokio::select! {
                _ = &mut stop => {
                    self.detach(BridgeError::ConnectionLost("session stopped".to_string()));
                    return;
                }
                ended = self.serve_link(&mut link) => ended,
            };
            drop(link);

            if was_open {
                info!("Disconnected from {}: {}", self.config.address, reason);
                attempt = 0;
            } else {
                warn!("Could not connect to {}: {}", self.config.address, reason);
            }
            self.detach(BridgeError::ConnectionLost(reason));

            attempt = attempt.saturating_add(1);
            if !policy.permits(attempt) {
                if policy.enabled {
                    warn!(
                        "Giving up on {} after {} reconnect attempt(s)",
                        self.config.address,
                        attempt - 1
                    );
                }
                return;
            }

            let delay = policy.delay_for(attempt);
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            debug!("Reconnecting to {} in {:?} (attempt {})", self.config.address, delay, attempt);

            tokio::select! {
                _ = &mut stop => {
                    self.detach(BridgeError::ConnectionLost("session stopped".to_string()));
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Process one link's events until it ends.
    ///
    /// Returns whether the link ever opened and why it ended.
    async fn serve_link(self: &Arc<Self>, link: &mut Link) -> (bool, String) {
        let mut opened = false;

        loop {
            match link.next_event().await {
                TransportEvent::Open if !opened => {
                    opened = true;
                    *lock(&self.outbound) = Some(link.sender());
                    self.connections.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Open);
                    info!("Connected to {}", self.config.address);
                }
                TransportEvent::Open => debug!("Ignoring repeated open event"),
                TransportEvent::Message(bytes) if opened => {
                    self.handle_message(&bytes, link.sender());
                }
                TransportEvent::Message(_) => warn!("Dropping message received before open"),
                TransportEvent::Closed(reason) => return (opened, reason),
                TransportEvent::Error(detail) => return (opened, detail),
            }
        }
    }

    fn handle_message(self: &Arc<Self>, bytes: &[u8], link: LinkSender) {
        let envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping undecodable message ({} bytes): {}", bytes.len(), e);
                return;
            }
        };

        debug!("<- {} {}", envelope.kind(), envelope.id());

        match envelope {
            Envelope::Request {
                id,
                procedure,
                payload,
                debug,
            } => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.serve_request(link, id, procedure, payload, debug).await;
                });
            }
            Envelope::Response { id, payload, .. } => {
                self.pending.resolve(id, payload);
            }
            Envelope::ErrorResponse { id, error, .. } => {
                self.pending.reject(id, error);
            }
        }
    }

    async fn serve_request(
        &self,
        link: LinkSender,
        id: CorrelationId,
        procedure: String,
        payload: Value,
        debug: bool,
    ) {
        let reply = match self.routes.dispatch(&procedure, payload).await {
            Ok(value) => Envelope::response(id, value),
            Err(e) => {
                warn!("Request {} ({}) failed: {}", id, procedure, e);
                Envelope::error_response(id, e.to_detail())
            }
        }
        .with_debug(debug);

        match self.send_on(&link, &reply) {
            Ok(()) => debug!("-> {} {}", reply.kind(), id),
            Err(e) => debug!("Dropping {} for {} ({}): {}", reply.kind(), id, procedure, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, ReconnectPolicy};
    use crate::envelope::ErrorDetail;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::new(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 8099,
        });
        config.reconnect = ReconnectPolicy::disabled();
        config
    }

    async fn open_session() -> (Session, MemoryPeer) {
        let (transport, mut peers) = MemoryTransport::new();
        let session = Session::new(config(), transport);
        session.start();
        let peer = peers.recv().await.expect("peer");
        session.wait_for_state(ConnectionState::Open).await;
        (session, peer)
    }

    #[tokio::test]
    async fn test_call_before_open_is_not_connected() {
        let (transport, _peers) = MemoryTransport::new();
        let session = Session::new(config(), transport);

        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(
            session.call("ping", Value::Null).await,
            Err(BridgeError::NotConnected)
        );
        assert_eq!(session.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_request_reaches_peer_and_resolves() {
        let (session, mut peer) = open_session().await;

        let reply = session.invoke("ping", Value::Null).unwrap();
        let id = reply.id();

        let request = peer.recv_envelope().await.unwrap();
        assert_eq!(request, Envelope::request(id, "ping", Value::Null));

        peer.send_envelope(&Envelope::response(id, json!({"status": "ok"})));
        assert_eq!(reply.await, Ok(json!({"status": "ok"})));
        assert_eq!(session.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_call() {
        let (session, mut peer) = open_session().await;

        let reply = session.invoke("read", Value::Null).unwrap();
        let request = peer.recv_envelope().await.unwrap();
        peer.send_envelope(&Envelope::error_response(
            request.id(),
            ErrorDetail::new("no document open"),
        ));

        assert_eq!(
            reply.await,
            Err(BridgeError::Remote {
                message: "no document open".to_string(),
                code: None,
            })
        );
    }

    #[tokio::test]
    async fn test_debug_flag_goes_out_on_request() {
        let (session, mut peer) = open_session().await;

        let options = CallOptions {
            debug: true,
            ..CallOptions::default()
        };
        let _reply = session.invoke_with("ping", Value::Null, options).unwrap();
        assert!(peer.recv_envelope().await.unwrap().is_debug());
    }

    #[tokio::test]
    async fn test_peer_close_drains_and_closes() {
        let (session, mut peer) = open_session().await;

        let reply = session.invoke("getLayers", Value::Null).unwrap();
        let _ = peer.recv().await;
        peer.close("host quit");

        assert_eq!(
            reply.await,
            Err(BridgeError::ConnectionLost("host quit".to_string()))
        );
        session.wait_for_state(ConnectionState::Closed).await;
        assert_eq!(session.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_stop_drains_with_session_stopped() {
        let (session, _peer) = open_session().await;
        let reply = session.invoke("read", Value::Null).unwrap();

        session.stop().await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(
            reply.await,
            Err(BridgeError::ConnectionLost("session stopped".to_string()))
        );

        // Idempotent
        session.stop().await;
        assert_eq!(
            session.call("read", Value::Null).await,
            Err(BridgeError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_undecodable_input_keeps_connection() {
        let (session, mut peer) = open_session().await;

        peer.send(b"not json at all".to_vec());
        peer.send(br#"{"kind":"mystery","id":1}"#.to_vec());

        let reply = session.invoke("ping", Value::Null).unwrap();
        let request = peer.recv_envelope().await.unwrap();
        peer.send_envelope(&Envelope::response(request.id(), json!("pong")));

        assert_eq!(reply.await, Ok(json!("pong")));
        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(session.stats().decode_failures, 2);
    }

    #[tokio::test]
    async fn test_inbound_request_is_served() {
        let (session, mut peer) = open_session().await;
        session.register_route("read", |_payload: Value| async { Ok(json!("Untitled-1")) });

        peer.send_envelope(&Envelope::request(CorrelationId(41), "read", json!({})));
        assert_eq!(
            peer.recv_envelope().await.unwrap(),
            Envelope::response(CorrelationId(41), json!("Untitled-1"))
        );
    }

    #[tokio::test]
    async fn test_refused_connection_stops_without_reconnect() {
        let (transport, _peers) = MemoryTransport::new();
        transport.set_refusing(true);
        let session = Session::new(config(), transport.clone());

        assert!(!session.is_running());
        session.start();
        assert!(session.is_running());

        session.wait_until_stopped().await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(session.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (transport, mut peers) = MemoryTransport::new();
        let session = Session::new(config(), transport.clone());
        session.start();
        session.start();

        let _peer = peers.recv().await.unwrap();
        session.wait_for_state(ConnectionState::Open).await;
        assert_eq!(transport.open_count(), 1);
    }
}
