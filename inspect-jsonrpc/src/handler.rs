//! The code that runs in response to a JSON-RPC method call or notification is called a
//! "handler".  All such code implements [`Handler`], although it's not intended that most users
//! will implement that directly.
//!
//! Instead, async functions whose arguments are all "extractors" (types implementing
//! [`FromRequest`]) and whose return type implements [`IntoResponse`] get a blanket
//! implementation of [`Handler`], in the style of axum.  A handler typically looks like:
//!
//! ```ignore
//! async fn block(State(env): State<Env>, Params(params): Params<HeightParams>) -> Result<Block, QueryError>
//! ```
//!
//! which means the parameter decoding is spelled out by the type of the `Params` extractor, and
//! the response encoding by the `Serialize` impl of the return type.
use std::convert::Infallible;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::{JsonRpcError, Result, transport, types};

/// A method invocation (or notification) after it has been decoded from the wire, along with the
/// metadata the transport knows about the peer that sent it.
pub struct Request {
    pub id: Option<types::Id>,
    pub method: String,
    pub params: Option<JsonValue>,
    pub metadata: Arc<transport::TransportMetadata>,
}

impl Request {
    pub fn from_request_message(metadata: Arc<transport::TransportMetadata>, request: types::Request) -> Self {
        Self {
            id: Some(request.id),
            method: request.method,
            params: request.params,
            metadata,
        }
    }

    pub fn from_notification_message(
        metadata: Arc<transport::TransportMetadata>,
        notification: types::Notification,
    ) -> Self {
        Self {
            id: None,
            method: notification.method,
            params: notification.params,
            metadata,
        }
    }
}

/// Inspired by axum's `FromRequest` trait.
///
/// Unlike axum there is only one trait, because a JSON-RPC request is always small and already
/// fully decoded by the time it reaches a handler, so nothing needs to consume it.
pub trait FromRequest<S>: Sized {
    /// The error type that indicates the extraction of this type from the request failed for some
    /// reason.
    type Rejection: IntoResponse;

    /// Extract the implementor's type from the request.
    fn from_request(request: &Request, state: &S) -> Result<Self, Self::Rejection>;
}

/// Extractor that deserializes the request params into `T`.
///
/// Omitted params deserialize as an empty object, so a `T` whose fields are all optional can be
/// invoked with no params at all.
pub struct Params<T>(pub T);

impl<T: DeserializeOwned, S> FromRequest<S> for Params<T> {
    type Rejection = JsonRpcError;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        let params = request
            .params
            .clone()
            .unwrap_or_else(|| JsonValue::Object(Default::default()));
        serde_json::from_value(params.clone())
            .map(Params)
            .map_err(|e| JsonRpcError::DeserRequest {
                source: e,
                type_name: std::any::type_name::<T>(),
                request: params,
            })
    }
}

/// The raw params, `null` if the request had none.
impl<S> FromRequest<S> for JsonValue {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.params.clone().unwrap_or_default())
    }
}

/// Extractor that exposes state to the handler.
pub struct State<S: Clone>(pub S);

impl<S: Clone> FromRequest<S> for State<S> {
    type Rejection = Infallible;

    fn from_request(_request: &Request, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(state.clone()))
    }
}

/// Extractor for the name of the method being invoked.  Mostly useful in fallback handlers.
pub struct MethodName(pub String);

impl<S> FromRequest<S> for MethodName {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.method.clone()))
    }
}

/// Extractor for the transport-specific identifier of the peer that sent the request (for
/// network transports, its `ip:port`).
pub struct RemotePeer(pub String);

impl<S> FromRequest<S> for RemotePeer {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.metadata.remote_peer.clone()))
    }
}

/// Methods that need the request ID but also want to be callable as a notification.
impl<S> FromRequest<S> for Option<types::Id> {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.id.clone())
    }
}

/// Methods that need the request ID and must not be invoked as a notification.
///
/// WARNING: a notification has nobody to report the rejection to, so invoking such a method as a
/// notification silently does nothing.
impl<S> FromRequest<S> for types::Id {
    type Rejection = types::ErrorDetails;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        request
            .id
            .clone()
            .ok_or_else(|| types::ErrorDetails::invalid_params("This method cannot be invoked as a notification", None))
    }
}

/// Type implemented by anything that can be converted into a JSON RPC response.
pub trait IntoResponse {
    /// Convert the implementor's type into a JSON RPC response.
    fn into_response(self) -> types::ResponsePayload;
}

/// Handlers that return a result can be automatically converted into a response payload,
/// provided the success type implements [`Serialize`] and the error type converts into
/// [`types::ErrorDetails`].
impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<types::ErrorDetails>,
{
    fn into_response(self) -> types::ResponsePayload {
        match self {
            Ok(value) => types::ResponsePayload::serialize_to_success(value),
            Err(e) => types::ResponsePayload::error(e.into()),
        }
    }
}

/// If a handler returns a `JsonValue`, we assume that it's infallible and this is a success
/// response
impl IntoResponse for JsonValue {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(self)
    }
}

impl IntoResponse for () {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(JsonValue::Null)
    }
}

impl IntoResponse for JsonRpcError {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

impl IntoResponse for types::ErrorDetails {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> types::ResponsePayload {
        match self {}
    }
}

/// A handler for JSON-RPC methods and notifications.
///
/// In the JSON RPC spec the only difference between a method invocation and a notification is
/// that a notification has no ID, so there is nobody to send a response to.  Every handler can be
/// called either way; the blanket impls run the method and discard the result for notifications.
///
/// ## Type Parameters
///
/// - `HackT`: a hack to get around Rust's rules for trait implementation.  The blanket impls for
///   async functions need the argument types to appear in the trait signature somewhere.  This is
///   erased once the handler is registered with the router, so try to ignore it mentally.
/// - `S`: the type of the router state passed to every handler.
pub trait Handler<HackT, S>: Clone + Send + Sync + Sized + 'static {
    type MethodFuture: Future<Output = types::ResponsePayload> + Send + 'static;
    type NotificationFuture: Future<Output = ()> + Send + 'static;

    /// Handle the method when it's invoked as a request, returning a response or an error.
    fn handle_method(self, state: S, request: Request) -> Self::MethodFuture;

    /// Handle the method when it's invoked as a notification.
    fn handle_notification(self, state: S, request: Request) -> Self::NotificationFuture;
}

/// Private helper implemented for every type that gets the blanket [`Handler`] impl, so the
/// argument extraction logic is written once and shared by the method and notification paths.
trait HandlerImplHelper<HackT, S>: Clone + Send + Sync + Sized + 'static {
    type MethodArgsTupl;
    type MethodResponse: IntoResponse;
    type MethodFuture: Future<Output = Self::MethodResponse> + Send;

    fn extract_method_args(state: &S, request: &Request) -> Result<Self::MethodArgsTupl, types::ResponsePayload>;

    fn call_impl_func(self, args: Self::MethodArgsTupl) -> Self::MethodFuture;
}

/// Invoke a macro for all supported tuples of handler arguments.
///
/// Borrowed from axum's `all_the_tuples!`, cut down to the number of extractors a handler can
/// usefully take here.
#[rustfmt::skip]
macro_rules! all_the_tuples {
    ($name:ident) => {
        $name!([], T1);
        $name!([T1], T2);
        $name!([T1, T2], T3);
    };
}

/// Generates the [`Handler`] impls for async functions whose arguments are all extractors.
macro_rules! impl_method_handler {
    (
        [$($ty:ident),*], $last:ident
    ) => {
        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> HandlerImplHelper<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse + 'static,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static {
            type MethodArgsTupl = ($($ty,)* $last,);
            type MethodResponse = Res;
            type MethodFuture = Fut;

            fn extract_method_args(state: &S, request: &Request) -> Result<Self::MethodArgsTupl, types::ResponsePayload> {
                $(
                    let $ty = match $ty::from_request(request, state) {
                        Ok(value) => value,
                        Err(rejection) => return Err(rejection.into_response()),
                    };
                )*

                let $last = match $last::from_request(request, state) {
                    Ok(value) => value,
                    Err(rejection) => return Err(rejection.into_response()),
                };

                Ok(($($ty,)* $last,))
            }

            fn call_impl_func(self, ($($ty,)* $last,): Self::MethodArgsTupl) -> Self::MethodFuture {
                self($($ty,)* $last,)
            }
        }

        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> Handler<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse + 'static,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static {
            type MethodFuture = Pin<Box<dyn Future<Output = types::ResponsePayload> + Send + 'static>>;
            type NotificationFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

            fn handle_method(self, state: S, request: Request) -> Self::MethodFuture {
                let args = <Self as HandlerImplHelper<($($ty,)* $last,), S>>::extract_method_args(&state, &request);
                async move {
                    let args = match args {
                        Ok(args) => args,
                        Err(err) => return err,
                    };

                    <Self as HandlerImplHelper<($($ty,)* $last,), S>>::call_impl_func(self, args)
                        .await
                        .into_response()
                }.boxed()
            }

            fn handle_notification(self, state: S, request: Request) -> Self::NotificationFuture {
                let args = <Self as HandlerImplHelper<($($ty,)* $last,), S>>::extract_method_args(&state, &request);
                async move {
                    if let Ok(args) = args {
                        let _ = <Self as HandlerImplHelper<($($ty,)* $last,), S>>::call_impl_func(self, args).await;
                    }
                }.boxed()
            }
        }
    };
}

all_the_tuples!(impl_method_handler);

/// A dyn compatible version of [`Handler`], with the `HackT` parameter erased so handlers of
/// different shapes can live in the same route map.
pub(crate) trait ErasedHandler<S>: Send + Sync + 'static {
    fn handle_method(&self, state: S, request: Request) -> BoxFuture<'static, types::ResponsePayload>;

    fn handle_notification(&self, state: S, request: Request) -> BoxFuture<'static, ()>;
}

struct ErasedHandlerWrapper<H, HackT> {
    handler: H,
    _hack: PhantomData<fn() -> HackT>,
}

impl<H, HackT, S> ErasedHandler<S> for ErasedHandlerWrapper<H, HackT>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    fn handle_method(&self, state: S, request: Request) -> BoxFuture<'static, types::ResponsePayload> {
        self.handler.clone().handle_method(state, request).boxed()
    }

    fn handle_notification(&self, state: S, request: Request) -> BoxFuture<'static, ()> {
        self.handler.clone().handle_notification(state, request).boxed()
    }
}

pub(crate) fn erase_handler<H, HackT, S>(handler: H) -> Arc<dyn ErasedHandler<S>>
where
    H: Handler<HackT, S>,
    HackT: Send + Sync + 'static,
    S: 'static,
{
    Arc::new(ErasedHandlerWrapper {
        handler,
        _hack: PhantomData,
    })
}
