//! After JSON RPC messages have been decoded, those that represent method calls or notifications
//! need to be routed to the corresponding handler, and that handler invoked.  The logic to perform
//! this is called "routing", and is implemented in the [`Router`] type in this module.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::Value as JsonValue;

use crate::{JsonRpcError, error, handler, transport, types};

/// Static description of a registered method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodSpec {
    /// Parameter names in positional order.  Used to name the elements of positional (array)
    /// params and to decide whether a URI-style call supplied every parameter.
    pub params: &'static [&'static str],

    /// Whether a successful result may be cached by the caller.
    pub cacheable: bool,
}

impl MethodSpec {
    pub const fn new(params: &'static [&'static str], cacheable: bool) -> Self {
        Self { params, cacheable }
    }
}

#[derive(Clone)]
struct Route<S> {
    spec: MethodSpec,
    handler: Arc<dyn handler::ErasedHandler<S>>,
}

/// Router inspired loosely by the `axum` crate router, but simplified and specialized for
/// JSON-RPC.
///
/// This router is much simpler than the `axum` router because it only has to route requests based
/// on the JSON-RPC method name, and the requests that it is routing are not HTTP requests but
/// complete, already-decoded JSON RPC requests.
///
/// The route map is shared behind an `Arc`.  Registering methods after the router has been cloned
/// copies the map, so a clone handed to a server never observes later registrations.
#[derive(Clone)]
pub struct Router<S: Clone + Send + Sync + 'static = ()> {
    state: S,
    routes: Arc<HashMap<String, Route<S>>>,
    fallback: Arc<dyn handler::ErasedHandler<S>>,
}

impl Router {
    /// Create a new router that doesn't need any state.
    pub fn new_stateless() -> Router<()> {
        Router::new_with_state(())
    }
}

async fn method_not_found(handler::MethodName(method_name): handler::MethodName) -> types::ErrorDetails {
    types::ErrorDetails::method_not_found(format!("Method not found: {method_name}"), None)
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    /// Create a new router whose handlers can access the provided shared state
    pub fn new_with_state(state: S) -> Self {
        Router {
            state,
            routes: Arc::new(HashMap::new()),
            fallback: handler::erase_handler(method_not_found),
        }
    }

    /// Return the current state in the router.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Register a handler for `method`, replacing any previous handler of the same name.
    pub fn register_method<H, HackT>(&mut self, method: impl Into<String>, spec: MethodSpec, handler: H)
    where
        H: handler::Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.routes).insert(
            method.into(),
            Route {
                spec,
                handler: handler::erase_handler(handler),
            },
        );
    }

    /// Builder-style version of [`Self::register_method`].
    pub fn with_method<H, HackT>(mut self, method: impl Into<String>, spec: MethodSpec, handler: H) -> Self
    where
        H: handler::Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.register_method(method, spec, handler);
        self
    }

    /// Replace the handler invoked for methods that aren't registered.
    pub fn register_fallback_handler<H, HackT>(&mut self, handler: H)
    where
        H: handler::Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.fallback = handler::erase_handler(handler);
    }

    /// Look up the spec of a registered method.
    pub fn method(&self, name: &str) -> Option<MethodSpec> {
        self.routes.get(name).map(|route| route.spec)
    }

    /// All registered methods, sorted by name.
    pub fn methods(&self) -> Vec<(&str, MethodSpec)> {
        let mut methods: Vec<_> = self
            .routes
            .iter()
            .map(|(name, route)| (name.as_str(), route.spec))
            .collect();
        methods.sort_by_key(|(name, _)| *name);
        methods
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Handle an invocation request, passing it to the matching handler, or running the fallback
    /// handler (which by default returns an error indicating that no such method was found).
    ///
    /// Resolves to `None` when the request was a notification.
    pub fn handle_invocation(&self, mut request: handler::Request) -> BoxFuture<'static, Option<types::Response>> {
        let handler = match self.routes.get(&request.method) {
            Some(route) => {
                if let Err(details) = name_positional_params(&route.spec, &mut request.params) {
                    return future::ready(request.id.map(|id| types::Response::error(id, details))).boxed();
                }
                route.handler.clone()
            }
            None => self.fallback.clone(),
        };

        let method = request.method.clone();
        let state = self.state.clone();

        // Invoke as an method or notification depending on whether the request has an ID
        match request.id.clone() {
            Some(id) => AssertUnwindSafe(handler.handle_method(state, request))
                .catch_unwind()
                .map(move |result| {
                    let payload = result.unwrap_or_else(|panic| {
                        let message = error::panic_err_to_string(panic);
                        tracing::error!(%method, %id, %message, "Method handler panicked");
                        types::ResponsePayload::error(JsonRpcError::HandlerPanic { message })
                    });
                    Some(types::Response::new(id, payload))
                })
                .boxed(),
            None => AssertUnwindSafe(handler.handle_notification(state, request))
                .catch_unwind()
                .map(move |result| {
                    if let Err(panic) = result {
                        let message = error::panic_err_to_string(panic);
                        tracing::error!(%method, %message, "Notification handler panicked");
                    }
                    None
                })
                .boxed(),
        }
    }

    /// Handle a complete decoded message received from a peer, producing the message (if any)
    /// that should be sent back.
    ///
    /// Batches are answered with a batch of the responses to their requests, in the order the
    /// requests appeared.  A batch made up only of notifications gets no answer at all.
    pub fn handle_message(
        &self,
        metadata: Arc<transport::TransportMetadata>,
        message: types::Message,
    ) -> BoxFuture<'static, Option<types::Message>> {
        match message {
            types::Message::Request(request) => self
                .handle_invocation(handler::Request::from_request_message(metadata, request))
                .map(|response| response.map(types::Message::Response))
                .boxed(),
            types::Message::Notification(notification) => self
                .handle_invocation(handler::Request::from_notification_message(metadata, notification))
                .map(|_| None)
                .boxed(),
            types::Message::Batch(messages) => {
                if messages.is_empty() {
                    return future::ready(Some(invalid_request(types::Id::Null, "Empty batch"))).boxed();
                }

                let futures: Vec<_> = messages
                    .into_iter()
                    .map(|message| match message {
                        types::Message::Batch(_) => {
                            future::ready(Some(invalid_request(types::Id::Null, "Nested batches are not allowed")))
                                .boxed()
                        }
                        message => self.handle_message(metadata.clone(), message),
                    })
                    .collect();

                future::join_all(futures)
                    .map(|responses| {
                        let responses: Vec<_> = responses.into_iter().flatten().collect();
                        (!responses.is_empty()).then_some(types::Message::Batch(responses))
                    })
                    .boxed()
            }
            types::Message::Response(response) => {
                tracing::warn!(
                    remote_peer = %metadata.remote_peer,
                    id = %response.id,
                    "Ignoring JSON-RPC response sent by a client"
                );
                future::ready(None).boxed()
            }
            types::Message::InvalidRequest(invalid) => {
                future::ready(Some(invalid_request(invalid.id, "Invalid request"))).boxed()
            }
        }
    }
}

/// The response sent when the incoming bytes were not JSON at all, or were JSON but not shaped
/// like any JSON-RPC message.
pub fn parse_error_response(e: JsonRpcError) -> types::Message {
    types::Message::Response(types::Response::error(types::Id::Null, e))
}

fn invalid_request(id: types::Id, message: &str) -> types::Message {
    types::Message::Response(types::Response::error(
        id,
        types::ErrorDetails::invalid_request(message, None),
    ))
}

/// Positional params are converted to named params using the method's declared parameter names,
/// so that handlers only ever have to decode an object.
fn name_positional_params(spec: &MethodSpec, params: &mut Option<JsonValue>) -> Result<(), types::ErrorDetails> {
    let Some(JsonValue::Array(values)) = params else {
        return Ok(());
    };

    if values.len() > spec.params.len() {
        return Err(types::ErrorDetails::invalid_params(
            format!(
                "Expected at most {} positional params, got {}",
                spec.params.len(),
                values.len()
            ),
            None,
        ));
    }

    let named = spec
        .params
        .iter()
        .zip(values.drain(..))
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    *params = Some(JsonValue::Object(named));

    Ok(())
}
