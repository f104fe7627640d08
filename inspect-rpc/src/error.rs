use std::path::PathBuf;

use inspect_jsonrpc::{ErrorDetails, JsonValue};
use thiserror::Error;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Failures of the network-facing side of the server: building it, binding it and running it.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid listen address '{addr}': {reason}")]
    InvalidListenAddress { addr: String, reason: &'static str },

    #[error("Failed to bind listener to {addr}")]
    Bind { addr: String, source: std::io::Error },

    #[error("Error reading TLS certificate chain from {}", path.display())]
    TlsCertificate {
        path: PathBuf,
        source: rustls::pki_types::pem::Error,
    },

    #[error("Error reading TLS private key from {}", path.display())]
    TlsPrivateKey {
        path: PathBuf,
        source: rustls::pki_types::pem::Error,
    },

    #[error("Invalid TLS configuration")]
    TlsConfig(#[from] rustls::Error),

    #[error("Invalid CORS {field} '{value}'")]
    Cors { field: &'static str, value: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listener was closed because the cancellation token fired.  Callers that cancelled the
    /// server on purpose can treat this as a normal shutdown.
    #[error("Listener closed")]
    ListenerClosed,

    #[error("Error accepting connection")]
    Accept { source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error reading config file {}", path.display())]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Error parsing config")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// Errors reported by a [`crate::QueryEnvironment`] implementation.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error")]
    Internal {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl QueryError {
    pub fn internal(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::Internal { source: source.into() }
    }
}

impl From<QueryError> for ErrorDetails {
    fn from(e: QueryError) -> Self {
        let data = match &e {
            QueryError::Internal { source } => JsonValue::String(source.to_string()),
            other => JsonValue::String(other.to_string()),
        };

        match e {
            QueryError::NotFound(_) | QueryError::InvalidArgument(_) => ErrorDetails::invalid_params("Invalid params", data),
            QueryError::Unavailable(_) | QueryError::Internal { .. } => ErrorDetails::internal_error("Internal error", data),
        }
    }
}

/// Errors reported by an [`crate::EventBus`].
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Subscription not found")]
    NotFound,

    #[error("Already subscribed to '{query}'")]
    AlreadySubscribed { query: String },

    #[error("Event bus unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<SubscriptionError> for ErrorDetails {
    fn from(e: SubscriptionError) -> Self {
        ErrorDetails::internal_error("Internal error", JsonValue::String(e.to_string()))
    }
}
