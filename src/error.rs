//! Typed errors surfaced to callers of the bridge.
//!
//! Every call made through a [`Session`](crate::session::Session) settles with
//! either a JSON value or one of these errors. Transport and decode failures
//! are handled inside the session and only show up here when they cost a
//! caller its answer.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{ErrorDetail, HANDLER_FAILURE, UNKNOWN_PROCEDURE};

/// Call-level error kinds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A call was attempted while the connection was not `Open`.
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the call's deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The connection went away while the call was pending.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The receiving side has no route for the procedure.
    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    /// A local route handler failed or panicked.
    #[error("Handler failed: {message}")]
    HandlerFailure {
        /// Handler's error message
        message: String,
        /// Optional application-defined code
        code: Option<i64>,
    },

    /// The peer answered with an error-response.
    #[error("Remote error{}: {message}", .code.map(|c| format!(" {}", c)).unwrap_or_default())]
    Remote {
        /// Error message sent by the peer
        message: String,
        /// Optional error code sent by the peer
        code: Option<i64>,
    },

    /// An outbound envelope could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The peer answered, but not with the shape the caller expected.
    #[error("Unexpected result from '{procedure}': {message}")]
    InvalidResult { procedure: String, message: String },
}

impl BridgeError {
    /// Render this error as the detail carried by an `error-response`.
    pub fn to_detail(&self) -> ErrorDetail {
        match self {
            BridgeError::UnknownProcedure(name) => ErrorDetail {
                message: format!("unknown procedure '{}'", name),
                code: Some(UNKNOWN_PROCEDURE),
            },
            BridgeError::HandlerFailure { message, code } => ErrorDetail {
                message: message.clone(),
                code: Some(code.unwrap_or(HANDLER_FAILURE)),
            },
            BridgeError::Remote { message, code } => ErrorDetail {
                message: message.clone(),
                code: *code,
            },
            other => ErrorDetail {
                message: other.to_string(),
                code: Some(HANDLER_FAILURE),
            },
        }
    }

    /// Rebuild a typed error from an `error-response` received for a call
    /// to `procedure`.
    pub fn from_detail(procedure: &str, detail: ErrorDetail) -> Self {
        match detail.code {
            Some(UNKNOWN_PROCEDURE) => BridgeError::UnknownProcedure(procedure.to_string()),
            code => BridgeError::Remote {
                message: detail.message,
                code,
            },
        }
    }

    /// Whether retrying on a fresh connection could succeed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BridgeError::NotConnected | BridgeError::ConnectionLost(_)
        )
    }
}
