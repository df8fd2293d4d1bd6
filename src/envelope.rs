//! Call envelopes and their JSON wire encoding.
//!
//! One envelope travels per transport message:
//!
//! ```text
//! {"kind":"request","id":7,"procedure":"getLayers","payload":{}}
//! {"kind":"response","id":7,"payload":[{"id":1,"name":"Background"}]}
//! {"kind":"error-response","id":7,"error":{"message":"no document","code":-32000}}
//! ```
//!
//! Fields not listed here are ignored on decode, so peers may attach extra
//! tracing data without breaking the protocol. The optional `debug` flag on a
//! request is echoed back on its response.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::BridgeError;

/// Error code for a request naming a procedure with no route.
pub const UNKNOWN_PROCEDURE: i64 = -32601;

/// Error code for a route handler that failed without a code of its own.
pub const HANDLER_FAILURE: i64 = -32000;

/// Token linking a request to its eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error carried by an `error-response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

/// The unit exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    Request {
        id: CorrelationId,
        procedure: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        debug: bool,
    },
    Response {
        id: CorrelationId,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        debug: bool,
    },
    ErrorResponse {
        id: CorrelationId,
        error: ErrorDetail,
        #[serde(default, skip_serializing_if = "is_false")]
        debug: bool,
    },
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl Envelope {
    pub fn request(id: CorrelationId, procedure: impl Into<String>, payload: Value) -> Self {
        Envelope::Request {
            id,
            procedure: procedure.into(),
            payload,
            debug: false,
        }
    }

    pub fn response(id: CorrelationId, payload: Value) -> Self {
        Envelope::Response {
            id,
            payload,
            debug: false,
        }
    }

    pub fn error_response(id: CorrelationId, error: ErrorDetail) -> Self {
        Envelope::ErrorResponse {
            id,
            error,
            debug: false,
        }
    }

    /// Correlation id, present on every kind.
    pub fn id(&self) -> CorrelationId {
        match self {
            Envelope::Request { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::ErrorResponse { id, .. } => *id,
        }
    }

    /// Wire name of this envelope's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::ErrorResponse { .. } => "error-response",
        }
    }

    pub fn is_debug(&self) -> bool {
        match self {
            Envelope::Request { debug, .. }
            | Envelope::Response { debug, .. }
            | Envelope::ErrorResponse { debug, .. } => *debug,
        }
    }

    /// Set the debug flag, consuming and returning the envelope.
    pub fn with_debug(mut self, flag: bool) -> Self {
        match &mut self {
            Envelope::Request { debug, .. }
            | Envelope::Response { debug, .. }
            | Envelope::ErrorResponse { debug, .. } => *debug = flag,
        }
        self
    }
}

/// Why an inbound message could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The message body is not UTF-8 text.
    #[error("Message is not valid UTF-8")]
    NotUtf8,

    /// The message body is not a JSON object.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The `kind` field names no known envelope kind.
    #[error("Unknown envelope kind '{0}'")]
    UnknownKind(String),

    /// A field required by the envelope's kind is absent.
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but structurally wrong.
    #[error("Invalid envelope: {0}")]
    Invalid(String),
}

/// Serialize an envelope to its wire form.
///
/// Output is deterministic: object keys inside payloads are emitted in
/// sorted order.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(envelope).map_err(|e| BridgeError::Encode(e.to_string()))
}

/// Parse one wire message.
///
/// Never panics on hostile input; every failure is a [`DecodeError`] so the
/// session can log and drop the message.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("expected a JSON object".to_string()))?;

    let kind = match object.get("kind") {
        Some(Value::String(kind)) => kind.as_str(),
        Some(_) => return Err(DecodeError::Invalid("'kind' must be a string".to_string())),
        None => return Err(DecodeError::MissingField("kind")),
    };

    let required: &[&'static str] = match kind {
        "request" => &["id", "procedure"],
        "response" => &["id"],
        "error-response" => &["id", "error"],
        other => return Err(DecodeError::UnknownKind(other.to_string())),
    };
    if let Some(missing) = required.iter().copied().find(|field| !object.contains_key(*field)) {
        return Err(DecodeError::MissingField(missing));
    }

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| DecodeError::Invalid(e.to_string()))?;

    if let Envelope::Request { procedure, .. } = &envelope {
        if procedure.is_empty() {
            return Err(DecodeError::Invalid("empty procedure name".to_string()));
        }
    }

    Ok(envelope)
}
