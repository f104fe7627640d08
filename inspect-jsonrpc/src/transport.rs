//! A "transport" abstracts away how JSON-RPC messages travel between peers.  At this level it is a
//! source and sink of text messages plus a name for the remote peer; the websocket session in the
//! server crate is written against this trait, not against a particular websocket library.
//!
//! Plain HTTP request/response does not go through a transport: each HTTP request carries exactly
//! one message (or batch) and is dispatched straight into the [`crate::Router`].
use std::borrow::Cow;

use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, TryFutureExt};

use crate::{JsonRpcError, Result};

/// A transport is a source and sink of JSON-RPC messages, that interfaces with some underlying
/// transport layer provided by the caller.
pub trait Transport: Send + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transport-specific identifier of the remote peer.  For network transports this is the
    /// peer's `ip:port`, and it is the key under which the peer's subscriptions are tracked.
    fn remote_peer(&self) -> Cow<'static, str>;

    /// Send a message to the remote peer.  Should not complete until the message has been handed
    /// off to the underlying transport.
    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Receive a message from the transport.
    ///
    /// This future must be cancelation-safe: dropping it before it completes must not lose or
    /// truncate a message.
    ///
    /// Returns `Ok(None)` once the transport is closed and no more messages can be received.
    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_;

    /// Called periodically by long-lived sessions.  Transports with a liveness protocol (websocket
    /// ping/pong) send a ping here and fail if the peer has gone quiet for too long.
    fn keepalive(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        futures::future::ready(Ok(()))
    }
}

/// What the transport knows about the peer a message came from.
#[derive(Clone, Debug)]
pub struct TransportMetadata {
    pub remote_peer: String,
}

impl TransportMetadata {
    pub fn new(remote_peer: impl Into<String>) -> Self {
        Self {
            remote_peer: remote_peer.into(),
        }
    }
}

/// Implement transport on a (stream, sink) pair, mainly for testing.  Production transports live
/// with the server that accepts them.
impl<In, InErr, Out> Transport for (In, Out)
where
    In: Stream<Item = Result<String, InErr>> + Unpin + Send + 'static,
    InErr: std::error::Error + Send + Sync + 'static,
    Out: Sink<String> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = JsonRpcError;

    fn remote_peer(&self) -> Cow<'static, str> {
        format!("({}, {})", std::any::type_name::<In>(), std::any::type_name::<Out>()).into()
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.1
            .send(message)
            .map_err(|e| JsonRpcError::Transport { source: Box::new(e) })
    }

    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_ {
        self.0.next().map(|opt_result: Option<Result<_, InErr>>| {
            opt_result
                .transpose()
                .map_err(|e| JsonRpcError::Transport { source: Box::new(e) })
        })
    }
}
