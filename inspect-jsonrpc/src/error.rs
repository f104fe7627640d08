use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types;

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum JsonRpcError {
    #[error("Error parsing JSON-RPC message")]
    ParseJson { source: serde_json::Error, json: String },

    #[error("Invalid params for {type_name}")]
    DeserRequest {
        source: serde_json::Error,
        type_name: &'static str,
        request: JsonValue,
    },

    #[error("Error serializing response {type_name} to JSON")]
    SerResponse {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Method handler panicked: {message}")]
    HandlerPanic { message: String },
}

/// Convert our internal error type into the JSON-RPC error that goes back to the remote peer.
impl From<JsonRpcError> for types::ErrorDetails {
    fn from(e: JsonRpcError) -> Self {
        match e {
            JsonRpcError::ParseJson { source, .. } => {
                types::ErrorDetails::parse_error("Parse error", JsonValue::String(source.to_string()))
            }
            JsonRpcError::DeserRequest { source, request, .. } => types::ErrorDetails::invalid_params(
                format!("Invalid params: {source}"),
                request,
            ),
            JsonRpcError::SerResponse { source, type_name } => types::ErrorDetails::internal_error(
                format!("Error serializing {type_name}"),
                JsonValue::String(source.to_string()),
            ),
            JsonRpcError::Transport { source } => {
                types::ErrorDetails::internal_error("Transport error", JsonValue::String(source.to_string()))
            }
            JsonRpcError::HandlerPanic { message } => {
                types::ErrorDetails::internal_error("Internal error", JsonValue::String(message))
            }
        }
    }
}

/// Render the payload of a caught panic as something that can be logged and reported.
pub(crate) fn panic_err_to_string(e: Box<dyn std::any::Any + Send + 'static>) -> String {
    if let Some(s) = e.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
