//! Route table for remote-initiated calls.
//!
//! Maps procedure names to async handlers. The session consults it for every
//! inbound request; handlers run in their own task so a panic turns into an
//! error-response instead of taking the bridge down.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::BridgeError;

/// What a handler produces.
pub type HandlerResult = Result<Value, HandlerError>;

/// Failure reported by a route handler.
///
/// Anything convertible into [`anyhow::Error`] converts into this, so
/// handlers can use `?` on their own fallible operations. It must not
/// implement `std::error::Error`, or that blanket conversion would overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub code: Option<i64>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        HandlerError::new(format!("{:#}", err.into()))
    }
}

impl From<HandlerError> for BridgeError {
    fn from(err: HandlerError) -> Self {
        BridgeError::HandlerFailure {
            message: err.message,
            code: err.code,
        }
    }
}

/// An async procedure implementation.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = HandlerResult>`
/// closure that is `Send + Sync + 'static`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, payload: Value) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Value) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(payload))
    }
}

/// Procedure name to handler mapping.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `procedure`, replacing any previous handler.
    pub fn register_route<F, Fut>(&self, procedure: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(procedure, handler);
    }

    /// Register any [`Handler`] implementation for `procedure`.
    pub fn register_handler<H: Handler>(&self, procedure: impl Into<String>, handler: H) {
        let procedure = procedure.into();
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.insert(procedure.clone(), Arc::new(handler)).is_some() {
            debug!("Replaced handler for '{}'", procedure);
        } else {
            debug!("Registered handler for '{}'", procedure);
        }
    }

    /// Remove the handler for `procedure`; returns whether one existed.
    pub fn remove_route(&self, procedure: &str) -> bool {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(procedure)
            .is_some()
    }

    pub fn contains(&self, procedure: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(procedure)
    }

    /// Registered procedure names, sorted.
    pub fn procedures(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn lookup(&self, procedure: &str) -> Option<Arc<dyn Handler>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(procedure)
            .cloned()
    }

    /// Run the handler for `procedure`.
    ///
    /// An unknown name fails with [`BridgeError::UnknownProcedure`] without
    /// running anything. Handler errors and panics both come back as
    /// [`BridgeError::HandlerFailure`].
    pub async fn dispatch(&self, procedure: &str, payload: Value) -> Result<Value, BridgeError> {
        let handler = self
            .lookup(procedure)
            .ok_or_else(|| BridgeError::UnknownProcedure(procedure.to_string()))?;

        // Building the future happens inside the task too, so a handler that
        // panics before its first await is caught as well.
        let task = tokio::spawn(async move { handler.call(payload).await });

        match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                debug!("Handler for '{}' failed: {}", procedure, err);
                Err(err.into())
            }
            Err(join_err) if join_err.is_panic() => {
                let reason = panic_message(join_err.into_panic());
                error!("Handler for '{}' panicked: {}", procedure, reason);
                Err(BridgeError::HandlerFailure {
                    message: format!("handler for '{}' panicked: {}", procedure, reason),
                    code: None,
                })
            }
            Err(_) => Err(BridgeError::HandlerFailure {
                message: format!("handler for '{}' was cancelled", procedure),
                code: None,
            }),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
