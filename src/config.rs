//! Bridge configuration.
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! `SCRIPTBRIDGE_*` environment variables. The binary applies its command
//! line flags last.
//!
//! ```json
//! {
//!   "address": "tcp://127.0.0.1:8099",
//!   "call_timeout_ms": 30000,
//!   "reconnect": { "initial_delay_ms": 100, "max_delay_ms": 5000, "max_attempts": null },
//!   "interpreter": { "program": "osascript", "args": ["-l", "JavaScript", "-"] }
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default per-call timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Environment variable overriding the endpoint address.
pub const ADDRESS_ENV: &str = "SCRIPTBRIDGE_ADDRESS";
/// Environment variable overriding the default call timeout.
pub const TIMEOUT_ENV: &str = "SCRIPTBRIDGE_TIMEOUT_MS";
/// Environment variable naming the scripting host interpreter.
pub const INTERPRETER_ENV: &str = "SCRIPTBRIDGE_INTERPRETER";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`BridgeConfig`].
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An endpoint address could not be understood.
    #[error("Invalid endpoint '{0}': expected tcp://host:port or unix:///path")]
    InvalidEndpoint(String),

    /// An override carried a value of the wrong shape.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Where the remote peer lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `unix:///path/to/socket`
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint address.
    ///
    /// Accepts `tcp://host:port`, `unix:///absolute/path` and, as a shorthand,
    /// a bare absolute path for a Unix socket.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpoint(address.to_string());
        let address = address.trim();

        if address.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(address)));
        }

        let url = Url::parse(address).map_err(|_| invalid())?;
        match url.scheme() {
            "tcp" => {
                let host = url.host_str().ok_or_else(invalid)?;
                let port = url.port().ok_or_else(invalid)?;
                // IPv6 hosts come back bracketed
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "unix" => {
                if url.path().is_empty() || url.path() == "/" {
                    return Err(invalid());
                }
                Ok(Endpoint::Unix(PathBuf::from(url.path())))
            }
            _ => Err(invalid()),
        }
    }

    /// `host:port` form for socket APIs; `None` for Unix sockets.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                Some(format!("[{}]:{}", host, port))
            }
            Endpoint::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            Endpoint::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { .. } => {
                write!(f, "tcp://{}", self.socket_addr().unwrap_or_default())
            }
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Unix(default_socket_path())
    }
}

/// Resolve the default socket path for the bridge.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/scriptbridge.sock` (Linux standard)
/// 2. `~/Library/Caches/scriptbridge.sock` (macOS)
/// 3. `/tmp/scriptbridge.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("scriptbridge.sock");
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("scriptbridge.sock");
    }

    PathBuf::from("/tmp/scriptbridge.sock")
}

/// Default location of the configuration file, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("scriptbridge").join("config.json"))
}

/// How the session re-establishes a dropped connection.
///
/// Delays double from `initial_delay_ms` up to `max_delay_ms`; set both to
/// the same value for a fixed delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts allowed after a drop before giving up; `None` is unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Reconnect after a fixed delay, at most `max_attempts` times in a row.
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            enabled: true,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            max_attempts,
        }
    }

    /// Whether attempt number `attempt` (1-based) may go ahead.
    pub fn permits(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms.max(self.initial_delay_ms));
        Duration::from_millis(ms)
    }
}

/// External interpreter that executes host scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Everything a bridge process needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub address: Endpoint,
    pub call_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub interpreter: Option<InterpreterConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: Endpoint::default(),
            call_timeout_ms: DEFAULT_TIMEOUT_MS,
            reconnect: ReconnectPolicy::default(),
            interpreter: None,
        }
    }
}

impl BridgeConfig {
    pub fn new(address: Endpoint) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    /// Default timeout applied to calls that do not name their own.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default config file
    /// is read when present, otherwise defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `SCRIPTBRIDGE_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup(ADDRESS_ENV) {
            self.address = Endpoint::parse(&address)?;
        }

        if let Some(timeout) = lookup(TIMEOUT_ENV) {
            self.call_timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: TIMEOUT_ENV,
                    value: timeout.clone(),
                })?;
        }

        if let Some(command) = lookup(INTERPRETER_ENV) {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts.next().ok_or_else(|| ConfigError::InvalidValue {
                key: INTERPRETER_ENV,
                value: command.clone(),
            })?;
            self.interpreter = Some(InterpreterConfig {
                program,
                args: parts.collect(),
            });
        }

        Ok(self)
    }
}
