//! The procedures spoken over the bridge.
//!
//! Two sides serve routes:
//!
//! - The **host** side ([`register_host_routes`]) runs inside, or next to, the
//!   scripting host. Each host command renders one [`HostScript`], executes
//!   it and formats the result.
//! - The **control** side ([`ControlHub`]) keeps the working context and
//!   relays host commands from any connected peer to the peer that announced
//!   itself as the host.
//!
//! [`HostStub`] is the typed client for all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::host::{HostScript, ScriptHost};
use crate::routes::{HandlerError, HandlerResult, RouteTable};
use crate::session::Session;

/// Liveness check; answers `{"status": "ok"}`.
pub const PING: &str = "ping";
/// Replace the control process's working context.
pub const SET_CONTEXT: &str = "set_context";
/// Read the control process's working context.
pub const GET_CONTEXT: &str = "get_context";
/// Mark the calling peer as the host that serves host commands.
pub const REGISTER_HOST: &str = "register_host";
/// Name of the active document.
pub const READ: &str = "read";
/// Layers of the active document.
pub const GET_LAYERS: &str = "getLayers";
/// Export one layer to a file.
pub const EXPORT_LAYER: &str = "exportLayer";

/// Commands executed by the scripting host.
pub const HOST_COMMANDS: [&str; 3] = [READ, GET_LAYERS, EXPORT_LAYER];

/// What the control process is currently working on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostContext {
    pub project: String,
    pub asset: String,
    pub task: String,
}

/// One layer as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// Payload of [`EXPORT_LAYER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLayer {
    pub layer: i64,
    pub path: String,
}

fn ping_status() -> Value {
    json!({"status": "ok"})
}

/// Serve [`PING`] on `routes`.
pub fn register_ping(routes: &RouteTable) {
    routes.register_route(PING, |_payload: Value| async { Ok(ping_status()) });
}

// =============================================================================
// Host side
// =============================================================================

/// Serve [`PING`] and the host command family, executing through `host`.
pub fn register_host_routes(routes: &RouteTable, host: Arc<dyn ScriptHost>) {
    register_ping(routes);

    let executor = Arc::clone(&host);
    routes.register_route(READ, move |_payload: Value| {
        let host = Arc::clone(&executor);
        async move { read_document(host.as_ref()).await }
    });

    let executor = Arc::clone(&host);
    routes.register_route(GET_LAYERS, move |_payload: Value| {
        let host = Arc::clone(&executor);
        async move { list_layers(host.as_ref()).await }
    });

    routes.register_route(EXPORT_LAYER, move |payload: Value| {
        let host = Arc::clone(&host);
        async move { export_layer(host.as_ref(), payload).await }
    });
}

async fn read_document(host: &dyn ScriptHost) -> HandlerResult {
    let script = HostScript::render("app.activeDocument.name", &[])?;
    match host.execute(script).await? {
        Value::Null => Err(HandlerError::new("no document is open")),
        Value::String(name) => Ok(Value::String(name)),
        other => Ok(Value::String(other.to_string())),
    }
}

async fn list_layers(host: &dyn ScriptHost) -> HandlerResult {
    let output = host.execute(HostScript::call("getLayers", &[])).await?;
    let layers = parse_layers(output)?;
    debug!("Host reported {} layer(s)", layers.len());
    Ok(serde_json::to_value(layers)?)
}

async fn export_layer(host: &dyn ScriptHost, payload: Value) -> HandlerResult {
    let request: ExportLayer = serde_json::from_value(payload)?;
    let script = HostScript::call(
        "exportLayer",
        &[request.layer.into(), request.path.as_str().into()],
    );
    host.execute(script).await?;
    Ok(serde_json::to_value(request)?)
}

/// Layers from host output, which may be JSON text or already-parsed JSON.
pub fn parse_layers(output: Value) -> Result<Vec<Layer>, serde_json::Error> {
    match output {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => serde_json::from_str(&text),
        other => serde_json::from_value(other),
    }
}

// =============================================================================
// Control side
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared state of the control process across all connected peers.
pub struct ControlHub {
    context: Mutex<HostContext>,
    peers: Mutex<HashMap<u64, Session>>,
    host: Mutex<Option<u64>>,
    next_peer: AtomicU64,
}

impl ControlHub {
    pub fn new(context: HostContext) -> Arc<Self> {
        Arc::new(Self {
            context: Mutex::new(context),
            peers: Mutex::new(HashMap::new()),
            host: Mutex::new(None),
            next_peer: AtomicU64::new(1),
        })
    }

    pub fn context(&self) -> HostContext {
        lock(&self.context).clone()
    }

    pub fn set_context(&self, context: HostContext) {
        info!(
            "Context set to project={} asset={} task={}",
            context.project, context.asset, context.task
        );
        *lock(&self.context) = context;
    }

    /// Serve the control procedures on `session` and track it as a peer.
    ///
    /// Returns the peer number to pass to [`detach`](Self::detach).
    pub fn attach(self: &Arc<Self>, session: &Session) -> u64 {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let routes = session.routes();
        register_ping(routes);

        // Routes hold the hub weakly; the hub holds the sessions.
        let hub = Arc::downgrade(self);
        routes.register_route(SET_CONTEXT, move |payload: Value| {
            let hub = hub.clone();
            async move {
                let context: HostContext = serde_json::from_value(payload)?;
                upgrade(&hub)?.set_context(context.clone());
                Ok(serde_json::to_value(context)?)
            }
        });

        let hub = Arc::downgrade(self);
        routes.register_route(GET_CONTEXT, move |_payload: Value| {
            let hub = hub.clone();
            async move { Ok(serde_json::to_value(upgrade(&hub)?.context())?) }
        });

        let hub = Arc::downgrade(self);
        routes.register_route(REGISTER_HOST, move |_payload: Value| {
            let hub = hub.clone();
            async move {
                upgrade(&hub)?.mark_host(peer);
                Ok(json!({"peer": peer}))
            }
        });

        for procedure in HOST_COMMANDS {
            let hub = Arc::downgrade(self);
            routes.register_route(procedure, move |payload: Value| {
                let hub = hub.clone();
                async move { upgrade(&hub)?.relay(procedure, payload).await }
            });
        }

        lock(&self.peers).insert(peer, session.clone());
        debug!("Attached peer {}", peer);
        peer
    }

    /// Forget a peer; if it was the host, no host is connected anymore.
    pub fn detach(&self, peer: u64) -> Option<Session> {
        let mut host = lock(&self.host);
        if *host == Some(peer) {
            info!("Host (peer {}) disconnected", peer);
            *host = None;
        }
        drop(host);
        lock(&self.peers).remove(&peer)
    }

    fn mark_host(&self, peer: u64) {
        info!("Peer {} registered as host", peer);
        *lock(&self.host) = Some(peer);
    }

    /// The session of the registered host, if one is connected.
    pub fn host(&self) -> Option<Session> {
        let host = (*lock(&self.host))?;
        lock(&self.peers).get(&host).cloned()
    }

    /// Sessions of every attached peer.
    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.peers).values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    async fn relay(&self, procedure: &str, payload: Value) -> HandlerResult {
        let host = self
            .host()
            .ok_or_else(|| HandlerError::new("no host is connected"))?;
        debug!("Relaying '{}' to the host", procedure);
        host.call(procedure, payload).await.map_err(|e| {
            let detail = e.to_detail();
            HandlerError {
                message: detail.message,
                code: detail.code,
            }
        })
    }
}

fn upgrade(hub: &Weak<ControlHub>) -> Result<Arc<ControlHub>, HandlerError> {
    hub.upgrade()
        .ok_or_else(|| HandlerError::new("bridge is shutting down"))
}

// =============================================================================
// Client
// =============================================================================

/// Typed calls over a [`Session`].
#[derive(Clone)]
pub struct HostStub {
    session: Session,
}

impl HostStub {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        procedure: &str,
        payload: Value,
    ) -> Result<T, BridgeError> {
        let value = self.session.call(procedure, payload).await?;
        serde_json::from_value(value).map_err(|e| BridgeError::InvalidResult {
            procedure: procedure.to_string(),
            message: e.to_string(),
        })
    }

    /// Whether the peer answers `ping` with `{"status": "ok"}`.
    pub async fn ping(&self) -> Result<bool, BridgeError> {
        let status = self.session.call(PING, Value::Null).await?;
        Ok(status == ping_status())
    }

    /// Name of the host's active document.
    pub async fn read(&self) -> Result<String, BridgeError> {
        self.call_typed(READ, json!({})).await
    }

    pub async fn get_layers(&self) -> Result<Vec<Layer>, BridgeError> {
        self.call_typed(GET_LAYERS, json!({})).await
    }

    pub async fn export_layer(&self, layer: i64, path: &str) -> Result<ExportLayer, BridgeError> {
        let payload = json!({"layer": layer, "path": path});
        self.call_typed(EXPORT_LAYER, payload).await
    }

    pub async fn set_context(&self, context: &HostContext) -> Result<HostContext, BridgeError> {
        let payload = serde_json::to_value(context).map_err(|e| BridgeError::Encode(e.to_string()))?;
        self.call_typed(SET_CONTEXT, payload).await
    }

    pub async fn get_context(&self) -> Result<HostContext, BridgeError> {
        self.call_typed(GET_CONTEXT, Value::Null).await
    }

    /// Announce this peer as the host to a control process.
    pub async fn register_host(&self) -> Result<u64, BridgeError> {
        let reply: Value = self.call_typed(REGISTER_HOST, Value::Null).await?;
        reply
            .get("peer")
            .and_then(Value::as_u64)
            .ok_or_else(|| BridgeError::InvalidResult {
                procedure: REGISTER_HOST.to_string(),
                message: "missing peer number".to_string(),
            })
    }
}
