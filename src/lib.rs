//! scriptbridge library
//!
//! A bidirectional RPC bridge between a long-lived control process and an
//! embedded scripting host:
//!
//! - `session` - connection lifecycle, outbound calls, inbound dispatch
//! - `transport` - byte-message links (TCP, Unix sockets, in-memory)
//! - `envelope` - the JSON wire format
//! - `registry` - outstanding calls, timeouts, exactly-once settlement
//! - `routes` - procedure handlers served to the peer
//! - `host` - safe script rendering and the scripting host boundary
//! - `procedures` - ping, context, host commands and the typed client
//! - `config` - endpoints, timeouts, reconnect policy
//!
//! # Example
//!
//! ```ignore
//! use scriptbridge::config::BridgeConfig;
//! use scriptbridge::procedures::HostStub;
//! use scriptbridge::session::{ConnectionState, Session};
//! use scriptbridge::transport::StreamConnector;
//!
//! let config = BridgeConfig::load(None)?.with_env()?;
//! let session = Session::new(config, StreamConnector::new());
//! session.start();
//! session.wait_for_state(ConnectionState::Open).await;
//!
//! let host = HostStub::new(session.clone());
//! let document = host.read().await?;
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod host;
pub mod procedures;
pub mod registry;
pub mod routes;
pub mod session;
pub mod transport;

pub use error::BridgeError;
pub use session::{ConnectionState, Session};
