//! Server configuration.
//!
//! [`RpcConfig`] is what operators write (usually as YAML); [`TransportConfig`] is what the
//! listener and the HTTP stack actually run with, derived from it at server start.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_LISTEN_ADDRESS: &str = "tcp://127.0.0.1:26657";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_BYTES: usize = 1_000_000;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Configuration of the RPC server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// `tcp://host:port` or `host:port`.
    pub listen_address: String,

    /// Origins allowed to make cross-origin requests.  `*` allows any origin; an empty list
    /// disables CORS entirely.
    pub cors_allowed_origins: Vec<String>,
    pub cors_allowed_methods: Vec<String>,
    pub cors_allowed_headers: Vec<String>,

    /// Maximum number of simultaneously open connections, including websockets.  0 means no
    /// limit.
    pub max_open_connections: usize,

    /// How long a transaction commit broadcast may take.  Only used here to size the write
    /// timeout, so responses served by a node sharing this config are never cut short.
    #[serde(with = "humantime_serde")]
    pub timeout_broadcast_tx_commit: Duration,

    /// Maximum size of a request body, and of a single websocket message.
    pub max_body_bytes: usize,

    /// Maximum size of the request headers.
    pub max_header_bytes: usize,

    /// PEM certificate chain.  TLS is enabled only when both this and `tls_key_file` are set.
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,

    /// How long to wait for open connections to finish after the listener is closed.  When
    /// unset, the server returns as soon as the listener is closed and lets connections finish
    /// on their own.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Option<Duration>,

    pub websocket: WebsocketConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            cors_allowed_origins: Vec::new(),
            cors_allowed_methods: vec!["HEAD".to_string(), "GET".to_string(), "POST".to_string()],
            cors_allowed_headers: vec![
                "Origin".to_string(),
                "Accept".to_string(),
                "Content-Type".to_string(),
                "X-Requested-With".to_string(),
                "X-Server-Time".to_string(),
            ],
            max_open_connections: 900,
            timeout_broadcast_tx_commit: Duration::from_secs(10),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            tls_cert_file: None,
            tls_key_file: None,
            shutdown_grace_period: None,
            websocket: WebsocketConfig::default(),
        }
    }
}

impl RpcConfig {
    /// CORS is enabled iff at least one origin is allowed.
    pub fn is_cors_enabled(&self) -> bool {
        !self.cors_allowed_origins.is_empty()
    }

    /// The certificate and key paths, if TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        match self.shutdown_grace_period {
            Some(timeout) => ShutdownPolicy::Drain { timeout },
            None => ShutdownPolicy::Detach,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.trim().is_empty() {
            return Err(invalid("listen_address", "must not be empty"));
        }
        if self.max_body_bytes == 0 {
            return Err(invalid("max_body_bytes", "must be greater than 0"));
        }
        if self.max_header_bytes == 0 {
            return Err(invalid("max_header_bytes", "must be greater than 0"));
        }
        if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
            return Err(invalid(
                "tls_cert_file",
                "tls_cert_file and tls_key_file must be set together",
            ));
        }

        self.websocket.validate()
    }

    /// Parse and validate a YAML config.  Fields that are missing take their default values.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }
}

/// Per-connection settings of websocket sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    /// Number of subscription events that may be queued for a connection before event producers
    /// are made to wait.
    pub write_channel_capacity: usize,

    /// Time allowed to write a message to the peer.
    #[serde(with = "humantime_serde")]
    pub write_wait: Duration,

    /// Time allowed to go without reading anything (including pongs) from the peer.
    #[serde(with = "humantime_serde")]
    pub read_wait: Duration,

    /// How often to ping the peer.  Must be less than `read_wait`.
    #[serde(with = "humantime_serde")]
    pub ping_period: Duration,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            write_channel_capacity: 100,
            write_wait: Duration::from_secs(10),
            read_wait: Duration::from_secs(30),
            ping_period: Duration::from_secs(27),
        }
    }
}

impl WebsocketConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.write_channel_capacity == 0 {
            return Err(invalid("websocket.write_channel_capacity", "must be greater than 0"));
        }
        if self.ping_period.is_zero() || self.ping_period >= self.read_wait {
            return Err(invalid(
                "websocket.ping_period",
                format!(
                    "must be non-zero and less than read_wait ({})",
                    humantime::format_duration(self.read_wait)
                ),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// What happens to open connections when the server is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Close the listener and return.  Connections finish their in-flight requests on their own.
    #[default]
    Detach,

    /// Close the listener, ask every connection to shut down once its in-flight requests are
    /// answered, and wait up to `timeout` for them before returning.
    ///
    /// Websocket sessions are not covered.  Once upgraded, a socket belongs to its session task,
    /// which keeps running until the peer disconnects or stops answering pings.
    Drain { timeout: Duration },
}

/// The settings the listener and HTTP stack run with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// 0 means no limit.
    pub max_open_connections: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_body_bytes: usize,
    pub max_header_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_open_connections: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn from_rpc_config(config: &RpcConfig) -> Self {
        let defaults = Self::default();

        Self {
            max_open_connections: config.max_open_connections,
            write_timeout: effective_write_timeout(defaults.write_timeout, config.timeout_broadcast_tx_commit),
            max_body_bytes: config.max_body_bytes,
            max_header_bytes: config.max_header_bytes,
            ..defaults
        }
    }
}

/// A response must be allowed to take at least as long as the slowest operation it may carry, so
/// when the commit timeout reaches the default write timeout the write timeout is raised just
/// past it.
pub fn effective_write_timeout(default_write_timeout: Duration, timeout_broadcast_tx_commit: Duration) -> Duration {
    if default_write_timeout <= timeout_broadcast_tx_commit {
        timeout_broadcast_tx_commit + Duration::from_secs(1)
    } else {
        default_write_timeout
    }
}
