//! Session behaviour against a scripted in-memory peer.
//!
//! The test plays the remote side through [`MemoryPeer`], so every byte the
//! session sends is visible and every answer is under the test's control.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::time::Instant;

use scriptbridge::config::{BridgeConfig, Endpoint, ReconnectPolicy};
use scriptbridge::envelope::{
    CorrelationId, Envelope, ErrorDetail, HANDLER_FAILURE, UNKNOWN_PROCEDURE,
};
use scriptbridge::host::{HostError, HostScript, ScriptHost};
use scriptbridge::procedures::{register_host_routes, HostStub};
use scriptbridge::session::{ConnectionState, Session};
use scriptbridge::transport::memory::PeerQueue;
use scriptbridge::transport::{MemoryPeer, MemoryTransport};
use scriptbridge::BridgeError;

// =============================================================================
// Helpers
// =============================================================================

fn config(reconnect: ReconnectPolicy) -> BridgeConfig {
    let mut config = BridgeConfig::new(Endpoint::Tcp {
        host: "127.0.0.1".to_string(),
        port: 8099,
    });
    config.reconnect = reconnect;
    config
}

struct Harness {
    session: Session,
    transport: MemoryTransport,
    peers: PeerQueue,
}

impl Harness {
    fn new(reconnect: ReconnectPolicy) -> Self {
        let (transport, peers) = MemoryTransport::new();
        let session = Session::new(config(reconnect), transport.clone());
        Self {
            session,
            transport,
            peers,
        }
    }

    /// Wait for the session's next link and for it to open.
    async fn next_peer(&mut self) -> MemoryPeer {
        let peer = self.peers.recv().await.expect("session opened a link");
        self.session.wait_for_state(ConnectionState::Open).await;
        peer
    }
}

async fn connected() -> (Session, MemoryPeer) {
    let mut harness = Harness::new(ReconnectPolicy::disabled());
    harness.session.start();
    let peer = harness.next_peer().await;
    (harness.session, peer)
}

/// Next request the session sent: (id, procedure, payload).
async fn next_request(peer: &mut MemoryPeer) -> (CorrelationId, String, Value) {
    match peer.recv_envelope().await.expect("session sent a message") {
        Envelope::Request {
            id,
            procedure,
            payload,
            ..
        } => (id, procedure, payload),
        other => panic!("expected a request, got {:?}", other),
    }
}

/// Host that always has `Untitled-1` open.
struct UntitledHost;

impl ScriptHost for UntitledHost {
    fn execute(&self, script: HostScript) -> BoxFuture<'_, Result<Value, HostError>> {
        let answer = if script.source().starts_with("app.activeDocument") {
            Ok(json!("Untitled-1"))
        } else {
            Err(HostError::Failed(format!("unsupported: {}", script)))
        };
        Box::pin(async move { answer })
    }
}

// =============================================================================
// Outbound calls
// =============================================================================

#[tokio::test]
async fn test_ping_resolves_with_peer_status() {
    let (session, mut peer) = connected().await;

    let stub = HostStub::new(session.clone());
    let ping = tokio::spawn(async move { stub.ping().await });

    let (id, procedure, payload) = next_request(&mut peer).await;
    assert_eq!(procedure, "ping");
    assert_eq!(payload, Value::Null);
    peer.send_envelope(&Envelope::response(id, json!({"status": "ok"})));

    assert_eq!(ping.await.unwrap(), Ok(true));
    assert_eq!(session.stats().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_layers_times_out_and_leaves_no_entry() {
    let (session, mut peer) = connected().await;
    let start = Instant::now();

    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call_with_timeout("getLayers", json!({}), Duration::from_millis(5000))
                .await
        })
    };

    // The peer sees the request and never answers
    let (id, procedure, _) = next_request(&mut peer).await;
    assert_eq!(procedure, "getLayers");

    assert_eq!(
        call.await.unwrap(),
        Err(BridgeError::Timeout(Duration::from_millis(5000)))
    );
    assert!(start.elapsed() >= Duration::from_millis(5000));
    assert_eq!(session.stats().pending, 0);

    // A late answer is counted and dropped without disturbing the link
    peer.send_envelope(&Envelope::response(id, json!([])));
    let ping = session.invoke("ping", Value::Null).unwrap();
    let (ping_id, _, _) = next_request(&mut peer).await;
    peer.send_envelope(&Envelope::response(ping_id, json!({"status": "ok"})));
    assert_eq!(ping.await, Ok(json!({"status": "ok"})));

    let stats = session.stats();
    assert_eq!(stats.late_responses, 1);
    assert_eq!(stats.unmatched_responses, 0);
    assert_eq!(session.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_permuted_responses_never_cross_wire() {
    let (session, mut peer) = connected().await;
    const CALLS: usize = 20;

    let replies: Vec<_> = (0..CALLS)
        .map(|i| session.invoke("echo", json!(i)).unwrap())
        .collect();

    let mut requests = Vec::new();
    for _ in 0..CALLS {
        requests.push(next_request(&mut peer).await);
    }

    // 7 is coprime with 20, so this visits every request in scrambled order
    for step in 0..CALLS {
        let (id, _, payload) = &requests[(step * 7) % CALLS];
        peer.send_envelope(&Envelope::response(*id, json!({"echo": payload})));
    }

    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.await, Ok(json!({"echo": i})));
    }
    assert_eq!(session.stats().pending, 0);
}

#[tokio::test]
async fn test_connection_loss_drains_every_call() {
    let (session, mut peer) = connected().await;

    let replies: Vec<_> = ["read", "getLayers", "exportLayer"]
        .into_iter()
        .map(|procedure| session.invoke(procedure, json!({})).unwrap())
        .collect();
    for _ in 0..replies.len() {
        next_request(&mut peer).await;
    }
    assert_eq!(session.stats().pending, 3);

    peer.close("host application quit");

    for reply in replies {
        assert_eq!(
            reply.await,
            Err(BridgeError::ConnectionLost("host application quit".to_string()))
        );
    }
    session.wait_for_state(ConnectionState::Closed).await;
    assert_eq!(session.stats().pending, 0);
    assert_eq!(
        session.call("read", json!({})).await,
        Err(BridgeError::NotConnected)
    );
}

#[tokio::test]
async fn test_transport_error_drains_like_close() {
    let (session, mut peer) = connected().await;

    let reply = session.invoke("read", json!({})).unwrap();
    next_request(&mut peer).await;
    peer.fail("broken pipe");

    assert_eq!(
        reply.await,
        Err(BridgeError::ConnectionLost("broken pipe".to_string()))
    );
}

#[tokio::test]
async fn test_cancel_settles_like_a_timeout() {
    let (session, mut peer) = connected().await;

    let reply = session.invoke("exportLayer", json!({"layer": 1})).unwrap();
    let id = reply.id();
    let (sent_id, _, _) = next_request(&mut peer).await;
    assert_eq!(sent_id, id);

    assert!(session.cancel(id));
    assert!(matches!(reply.await, Err(BridgeError::Timeout(_))));

    peer.send_envelope(&Envelope::response(id, Value::Null));
    // Round trip a ping so the late response has been processed
    let ping = session.invoke("ping", Value::Null).unwrap();
    let (ping_id, _, _) = next_request(&mut peer).await;
    peer.send_envelope(&Envelope::response(ping_id, Value::Null));
    ping.await.unwrap();

    assert_eq!(session.stats().late_responses, 1);
}

#[tokio::test]
async fn test_remote_unknown_procedure_is_typed() {
    let (session, mut peer) = connected().await;

    let reply = session.invoke("getLayers", json!({})).unwrap();
    let (id, _, _) = next_request(&mut peer).await;
    peer.send_envelope(&Envelope::error_response(
        id,
        ErrorDetail {
            message: "unknown procedure 'getLayers'".to_string(),
            code: Some(UNKNOWN_PROCEDURE),
        },
    ));

    assert_eq!(
        reply.await,
        Err(BridgeError::UnknownProcedure("getLayers".to_string()))
    );
}

// =============================================================================
// Inbound requests
// =============================================================================

#[tokio::test]
async fn test_inbound_read_is_answered_with_same_id() {
    let (session, mut peer) = connected().await;
    register_host_routes(session.routes(), Arc::new(UntitledHost));

    peer.send_envelope(&Envelope::request(CorrelationId(7), "read", json!({})));

    assert_eq!(
        peer.recv_envelope().await.unwrap(),
        Envelope::response(CorrelationId(7), json!("Untitled-1"))
    );
}

#[tokio::test]
async fn test_unknown_inbound_procedure_invokes_nothing() {
    let (session, mut peer) = connected().await;
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    session.register_route("ping", move |_payload: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!({"status": "ok"})) }
    });

    peer.send_envelope(&Envelope::request(CorrelationId(9), "getLayers", Value::Null));

    match peer.recv_envelope().await.unwrap() {
        Envelope::ErrorResponse { id, error, .. } => {
            assert_eq!(id, CorrelationId(9));
            assert_eq!(error.code, Some(UNKNOWN_PROCEDURE));
        }
        other => panic!("expected an error-response, got {:?}", other),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_handler_answers_with_failure() {
    let (session, mut peer) = connected().await;
    session.register_route("exportLayer", |_payload: Value| async {
        if true {
            panic!("host crashed mid-export");
        }
        Ok(Value::Null)
    });

    peer.send_envelope(&Envelope::request(CorrelationId(3), "exportLayer", json!({})));

    match peer.recv_envelope().await.unwrap() {
        Envelope::ErrorResponse { id, error, .. } => {
            assert_eq!(id, CorrelationId(3));
            assert_eq!(error.code, Some(HANDLER_FAILURE));
            assert!(error.message.contains("host crashed"), "got {}", error.message);
        }
        other => panic!("expected an error-response, got {:?}", other),
    }
    assert_eq!(session.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_debug_flag_is_echoed() {
    let (session, mut peer) = connected().await;
    session.register_route("ping", |_payload: Value| async { Ok(json!({"status": "ok"})) });

    peer.send_envelope(&Envelope::request(CorrelationId(1), "ping", Value::Null).with_debug(true));
    peer.send_envelope(&Envelope::request(CorrelationId(2), "ping", Value::Null));

    let mut echoed = Vec::new();
    for _ in 0..2 {
        let response = peer.recv_envelope().await.unwrap();
        echoed.push((response.id(), response.is_debug()));
    }
    echoed.sort();
    assert_eq!(echoed, vec![(CorrelationId(1), true), (CorrelationId(2), false)]);
}

// =============================================================================
// Hostile input
// =============================================================================

#[tokio::test]
async fn test_malformed_input_is_dropped_and_link_survives() {
    let (session, mut peer) = connected().await;

    peer.send(vec![0xff, 0x00, 0x13]);
    peer.send(b"{\"kind\":\"request\"".to_vec());
    peer.send(br#"{"kind":"request","id":1}"#.to_vec());
    peer.send(br#"{"kind":"telepathy","id":2}"#.to_vec());
    peer.send(br#"{"kind":"response","id":"two"}"#.to_vec());

    let reply = session.invoke("ping", Value::Null).unwrap();
    let (id, _, _) = next_request(&mut peer).await;
    peer.send_envelope(&Envelope::response(id, json!({"status": "ok"})));
    assert_eq!(reply.await, Ok(json!({"status": "ok"})));

    // Nothing was sent back for the garbage
    assert!(peer.try_recv().is_none());
    assert_eq!(session.stats().decode_failures, 5);
    assert_eq!(session.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_spoofed_response_is_unmatched() {
    let (session, mut peer) = connected().await;

    peer.send_envelope(&Envelope::response(CorrelationId(424242), json!("forged")));
    peer.send_envelope(&Envelope::error_response(
        CorrelationId(0),
        ErrorDetail::new("forged"),
    ));

    let reply = session.invoke("ping", Value::Null).unwrap();
    let (id, _, _) = next_request(&mut peer).await;
    peer.send_envelope(&Envelope::response(id, Value::Null));
    reply.await.unwrap();

    let stats = session.stats();
    assert_eq!(stats.unmatched_responses, 2);
    assert_eq!(stats.late_responses, 0);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_loss() {
    let mut harness =
        Harness::new(ReconnectPolicy::fixed(Duration::from_millis(100), None));
    harness.session.start();

    let first = harness.next_peer().await;
    first.close("host restarted");
    harness
        .session
        .wait_for_state(ConnectionState::Closed)
        .await;

    let mut second = harness.next_peer().await;
    let reply = harness.session.invoke("ping", Value::Null).unwrap();
    let (id, _, _) = next_request(&mut second).await;
    second.send_envelope(&Envelope::response(id, json!({"status": "ok"})));
    assert_eq!(reply.await, Ok(json!({"status": "ok"})));

    let stats = harness.session.stats();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.reconnect_attempts, 1);
    assert_eq!(harness.transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut harness =
        Harness::new(ReconnectPolicy::fixed(Duration::from_millis(100), Some(2)));
    harness.session.start();

    let peer = harness.next_peer().await;
    harness.transport.set_refusing(true);
    peer.close("host quit");

    harness.session.wait_until_stopped().await;
    assert_eq!(harness.session.state(), ConnectionState::Closed);
    // The first link plus two refused attempts
    assert_eq!(harness.transport.open_count(), 3);
    assert_eq!(harness.session.stats().reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_budget_resets_after_open() {
    let mut harness =
        Harness::new(ReconnectPolicy::fixed(Duration::from_millis(100), Some(1)));
    harness.session.start();

    let first = harness.next_peer().await;
    first.close("drop one");
    let second = harness.next_peer().await;
    second.close("drop two");
    let _third = harness.next_peer().await;

    assert_eq!(harness.session.state(), ConnectionState::Open);
    assert_eq!(harness.transport.open_count(), 3);
}

#[tokio::test]
async fn test_stop_drains_and_does_not_reconnect() {
    let mut harness = Harness::new(ReconnectPolicy::fixed(Duration::from_millis(10), None));
    harness.session.start();
    let mut peer = harness.next_peer().await;

    let reply = harness.session.invoke("read", json!({})).unwrap();
    next_request(&mut peer).await;

    harness.session.stop().await;
    assert_eq!(
        reply.await,
        Err(BridgeError::ConnectionLost("session stopped".to_string()))
    );
    assert_eq!(harness.session.state(), ConnectionState::Closed);
    assert!(!harness.session.is_running());
    assert!(peer.is_detached());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.open_count(), 1);
}

#[tokio::test]
async fn test_dropping_last_handle_stops_the_session() {
    let mut harness = Harness::new(ReconnectPolicy::fixed(Duration::from_millis(10), None));
    harness.session.start();
    let mut peer = harness.next_peer().await;

    let reply = harness.session.invoke("read", json!({})).unwrap();
    next_request(&mut peer).await;

    let mut states = harness.session.subscribe();
    let Harness {
        session, transport, ..
    } = harness;
    drop(session);

    assert_eq!(
        reply.await,
        Err(BridgeError::ConnectionLost("session stopped".to_string()))
    );
    assert_eq!(peer.recv().await, None);
    assert!(peer.is_detached());

    // The session itself is gone once its driver has finished
    while states.changed().await.is_ok() {}

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.open_count(), 1);
}
