//! A Rust implementation of the JSON-RPC 2.0 protocol, purpose-built for the ledger inspection
//! server in this repo.
//!
//! The crate knows nothing about HTTP, websockets or ledgers.  It provides the message types, an
//! axum-style handler/extractor framework, a [`Router`] that dispatches decoded messages to
//! handlers by method name, and a [`Transport`] abstraction for long-lived message streams.  The
//! server crate composes these with the network layer.
//!
//! This library owes a debt to the [`jsonrpsee`](https://github.com/paritytech/jsonrpsee) project,
//! which is a more general-purpose JSON-RPC framework in Rust.

mod error;
mod handler;
mod router;
#[cfg(test)]
pub mod testing;
mod transport;
mod types;

pub use error::{JsonRpcError, Result};
pub use handler::{FromRequest, Handler, IntoResponse, MethodName, Params, RemotePeer, Request, State};
pub use router::{MethodSpec, Router, parse_error_response};
pub use transport::{Transport, TransportMetadata};
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, InvalidRequest, JsonValue, Message, Notification, Response,
    ResponsePayload, SuccessResponse, TwoPointZero,
};

/// The wire-level request type, as distinct from the decoded [`Request`] handed to handlers.
pub use types::Request as RequestMessage;
