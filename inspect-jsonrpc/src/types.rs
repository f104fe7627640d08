//! Rust struct definitions that ser/de to/from JSON-RPC 2.0 messages.
//!
//! The basic protocol enums (error codes, the `"2.0"` version marker) are re-exported from
//! `jsonrpsee-types`.  The message envelopes are our own, because the `jsonrpsee` ones are built
//! around borrowed deserialization which is awkward to carry across the async boundaries of an
//! HTTP handler or a websocket session.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{JsonRpcError, Result};

pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// Request Id
///
/// Numbers are signed because URI-style invocations, which have no id of their own, are answered
/// with the conventional id `-1`.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Id {
    /// Null
    Null,
    /// Numeric id
    Number(i64),
    /// String id
    Str(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Null => f.write_str("null"),
            Id::Number(n) => write!(f, "{n}"),
            Id::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Serializable [JSON-RPC request object](https://www.jsonrpc.org/specification#request-object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Request ID
    pub id: Id,
    /// Name of the method to be invoked.
    pub method: String,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    /// Create a serializable JSON-RPC method call.
    pub fn new(id: Id, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// Something that was shaped badly enough not to be a request, but still carried an id.
///
/// We hold on to the id so that the "invalid request" error can be matched up by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidRequest {
    /// Request ID
    pub id: Id,
}

/// Serializable [JSON-RPC notification object](https://www.jsonrpc.org/specification#notification).
///
/// Differs from the request object in that it does not have an `id` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Name of the method to be invoked.
    pub method: String,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Notification {
    /// Create a serializable JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// JSON-RPC response object as defined in the [spec](https://www.jsonrpc.org/specification#response_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Payload which can be result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
    /// Request ID
    pub id: Id,
}

impl Response {
    pub fn new(id: Id, payload: ResponsePayload) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload,
            id,
        }
    }

    /// Create a successful response
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self::new(id, ResponsePayload::success(result))
    }

    /// Create an error response
    pub fn error(id: Id, details: impl Into<ErrorDetails>) -> Self {
        Self::new(id, ResponsePayload::error(details))
    }

    pub fn is_success(&self) -> bool {
        matches!(self.payload, ResponsePayload::Success(_))
    }
}

/// Possible payloads of a JSON RPC response
///
/// This is an `untagged` enum so that serde will try to deserialize into each variant in order
/// until one succeeds.  Success responses have `result` and error responses have `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Corresponds to failed JSON-RPC response with a error object with the field `error`.
    Error(ErrorResponse),
    /// Corresponds to successful JSON-RPC response with the field `result`.
    Success(SuccessResponse),
}

impl ResponsePayload {
    /// Create a successful response payload
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Serialize our way to a successful response payload, handling a serialization error by
    /// producing an error payload instead
    pub fn serialize_to_success<T: Serialize>(result: T) -> Self {
        match serde_json::to_value(result).map_err(|e| JsonRpcError::SerResponse {
            source: e,
            type_name: std::any::type_name::<T>(),
        }) {
            Ok(json) => Self::success(json),
            Err(e) => Self::error(e),
        }
    }

    /// Create an error response payload
    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(ErrorResponse {
            error: details.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

/// [Failed JSON-RPC response object](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// [JSON-RPC failed response error details](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Code
    pub code: ErrorCode,
    /// Message
    pub message: String,
    /// Optional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }
}

/// Every possible (valid) JSON-RPC message that can be sent over the wire
///
/// The order of variants matters, since serde tries each `untagged` variant in order.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// A batch of messages
    Batch(Vec<Message>),

    /// A request with method, id, and optional params
    Request(Request),

    /// A notification with method and optional params but no id
    Notification(Notification),

    /// A response containing either a result or error
    Response(Response),

    /// An invalid request that still has an id
    InvalidRequest(InvalidRequest),
}

impl Message {
    /// Attempt to deserialize a message from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| JsonRpcError::ParseJson {
            source: e,
            json: String::from_utf8_lossy(bytes).to_string(),
        })
    }

    /// Attempt to serialize this message into raw bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self).map_err(|e| JsonRpcError::SerResponse {
            source: e,
            type_name: std::any::type_name::<Self>(),
        })
    }

    /// Attempt to serialize this message into a JSON string.
    pub fn into_string(self) -> Result<String> {
        serde_json::to_string(&self).map_err(|e| JsonRpcError::SerResponse {
            source: e,
            type_name: std::any::type_name::<Self>(),
        })
    }
}

impl FromStr for Message {
    type Err = JsonRpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_bytes(s.as_bytes())
    }
}
