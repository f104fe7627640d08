//! Composition of the route table, the websocket endpoint and the HTTP middleware into the single
//! request handler the server runs.
//!
//! Endpoints:
//!
//! - `POST /`: JSON-RPC request, notification or batch in the body.
//! - `GET /{method}?name=value&...`: URI form of a single request.  Values are read as JSON where
//!   they parse as JSON and as strings otherwise, so `height=5` is a number.  `hash` and `query`
//!   are always strings: `hash=1234`, `hash=0xAB` and `hash="AB"` all arrive as strings, the last
//!   with its quotes removed.  The response id is always `-1`.
//! - `GET /websocket`: websocket upgrade.
//! - `GET /`: an HTML list of the endpoints above.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method as HttpMethod, StatusCode, header};
use axum::response::{Html, IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Extension, Json};
use inspect_jsonrpc::{ErrorDetails, Id, JsonValue, Message, Response, Router, TransportMetadata, parse_error_response};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{RpcConfig, TransportConfig};
use crate::error::ServerError;
use crate::subscription::EventBus;
use crate::websocket::WebsocketManager;

const CACHE_CONTROL_CACHEABLE: &str = "public, max-age=86400";

/// URI params that are strings even when they look like JSON numbers.
const STRING_PARAMS: &[&str] = &["hash", "query"];

/// One layer of middleware around the endpoints.
#[derive(Clone, Debug, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Cors(CorsLayer),
    Trace,
    WriteTimeout(Duration),
    BodyLimit(usize),
}

/// The middleware stack, listed outermost first.
#[derive(Clone, Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// `[Cors (if enabled), Trace, WriteTimeout, BodyLimit]`.  CORS is outermost so that
    /// preflight requests and every response, errors included, carry the CORS headers.
    pub fn from_config(config: &RpcConfig) -> Result<Self, ServerError> {
        let transport = TransportConfig::from_rpc_config(config);
        let mut stages = Vec::with_capacity(4);

        if config.is_cors_enabled() {
            stages.push(Stage::Cors(cors_layer(config)?));
        }
        stages.extend([
            Stage::Trace,
            Stage::WriteTimeout(transport.write_timeout),
            Stage::BodyLimit(transport.max_body_bytes),
        ]);

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(<&'static str>::from).collect()
    }

    /// Wrap `router` in every stage.  Each `layer` call wraps everything applied before it, so the
    /// stages are applied innermost first.
    pub fn apply(&self, router: axum::Router) -> axum::Router {
        self.stages.iter().rev().fold(router, |router, stage| match stage {
            Stage::Cors(cors) => router.layer(cors.clone()),
            Stage::Trace => router.layer(TraceLayer::new_for_http()),
            Stage::WriteTimeout(timeout) => {
                router.layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, *timeout))
            }
            Stage::BodyLimit(limit) => router
                .layer(RequestBodyLimitLayer::new(*limit))
                .layer(DefaultBodyLimit::disable()),
        })
    }
}

fn cors_layer(config: &RpcConfig) -> Result<CorsLayer, ServerError> {
    fn invalid(field: &'static str, value: &str) -> ServerError {
        ServerError::Cors {
            field,
            value: value.to_string(),
        }
    }

    let origins = if config.cors_allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let origins = config
            .cors_allowed_origins
            .iter()
            .map(|origin| HeaderValue::from_str(origin).map_err(|_| invalid("origin", origin)))
            .collect::<Result<Vec<_>, _>>()?;
        AllowOrigin::list(origins)
    };

    let methods = config
        .cors_allowed_methods
        .iter()
        .map(|method| HttpMethod::from_bytes(method.as_bytes()).map_err(|_| invalid("method", method)))
        .collect::<Result<Vec<_>, _>>()?;

    let headers = config
        .cors_allowed_headers
        .iter()
        .map(|name| HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid("header", name)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers))
}

#[derive(Clone)]
struct AppState<S: Clone + Send + Sync + 'static> {
    router: Router<S>,
    websocket: WebsocketManager<S>,
    max_body_bytes: usize,
}

/// Build the request handler serving `routes` over HTTP and websockets.
///
/// Fails if `config` doesn't validate or its CORS settings can't be parsed.
pub fn handler<S>(config: &RpcConfig, routes: Router<S>, event_bus: Arc<dyn EventBus>) -> Result<axum::Router, ServerError>
where
    S: Clone + Send + Sync + 'static,
{
    config.validate()?;
    let pipeline = Pipeline::from_config(config)?;

    let state = AppState {
        websocket: WebsocketManager::new(routes.clone(), event_bus, config.websocket.clone()),
        router: routes,
        max_body_bytes: config.max_body_bytes,
    };

    let endpoints = axum::Router::new()
        .route("/", post(jsonrpc::<S>).get(list_endpoints::<S>))
        .route("/websocket", get(websocket_upgrade::<S>))
        .route("/{method}", get(uri_invocation::<S>))
        .with_state(state);

    tracing::debug!(stages = ?pipeline.stage_names(), "Composed RPC handler");

    Ok(pipeline.apply(endpoints))
}

type Peer = Option<Extension<ConnectInfo<SocketAddr>>>;

fn peer_metadata(peer: Peer) -> Arc<TransportMetadata> {
    let remote_peer = match peer {
        Some(Extension(ConnectInfo(addr))) => addr.to_string(),
        None => "unknown".to_string(),
    };
    Arc::new(TransportMetadata::new(remote_peer))
}

async fn jsonrpc<S: Clone + Send + Sync + 'static>(
    State(app): State<AppState<S>>,
    peer: Peer,
    body: Bytes,
) -> HttpResponse {
    let message = match Message::from_bytes(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(err = %e, "Unparseable JSON-RPC request");
            return (StatusCode::BAD_REQUEST, Json(parse_error_response(e))).into_response();
        }
    };

    match app.router.handle_message(peer_metadata(peer), message).await {
        Some(reply) => Json(reply).into_response(),
        // Only notifications
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn uri_invocation<S: Clone + Send + Sync + 'static>(
    State(app): State<AppState<S>>,
    Path(method): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    peer: Peer,
) -> HttpResponse {
    let id = Id::Number(-1);

    let Some(spec) = app.router.method(&method) else {
        let response = Response::error(id, ErrorDetails::method_not_found(format!("Method not found: {method}"), None));
        return (StatusCode::NOT_FOUND, Json(Message::Response(response))).into_response();
    };

    let params: serde_json::Map<String, JsonValue> = spec
        .params
        .iter()
        .filter_map(|name| query.get(*name).map(|raw| (name.to_string(), uri_value(name, raw))))
        .collect();
    let all_params_given = params.len() == spec.params.len();

    let request = inspect_jsonrpc::Request {
        id: Some(id),
        method,
        params: Some(JsonValue::Object(params)),
        metadata: peer_metadata(peer),
    };

    let Some(response) = app.router.handle_invocation(request).await else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let cacheable = spec.cacheable && all_params_given && response.is_success();
    let mut http_response = Json(Message::Response(response)).into_response();
    if cacheable {
        http_response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_CACHEABLE));
    }

    http_response
}

fn uri_value(name: &str, raw: &str) -> JsonValue {
    let quoted = raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"');
    if STRING_PARAMS.contains(&name) && !quoted {
        return JsonValue::String(raw.to_string());
    }

    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

async fn list_endpoints<S: Clone + Send + Sync + 'static>(
    State(app): State<AppState<S>>,
    headers: HeaderMap,
) -> Html<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or("localhost");

    let mut html = String::from("<html><body>");
    let _ = write!(
        html,
        "<br>Available endpoints:<br><a href=\"//{host}/websocket\">//{host}/websocket</a></br>"
    );

    html.push_str("<br>Endpoints that require arguments:<br>");
    for (name, spec) in app.router.methods() {
        let args = spec
            .params
            .iter()
            .map(|param| format!("{param}=_{param}"))
            .collect::<Vec<_>>()
            .join("&");
        let _ = write!(html, "<a href=\"//{host}/{name}?{args}\">//{host}/{name}?{args}</a></br>");
    }
    html.push_str("</body></html>");

    Html(html)
}

async fn websocket_upgrade<S: Clone + Send + Sync + 'static>(
    State(app): State<AppState<S>>,
    peer: Peer,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    // Subscriptions are keyed by the peer address, so a session without one can't be tracked
    let Some(Extension(ConnectInfo(remote_addr))) = peer else {
        tracing::error!("Websocket upgrade without a remote address");
        return (StatusCode::INTERNAL_SERVER_ERROR, "remote address unavailable").into_response();
    };

    tracing::debug!(%remote_addr, "Upgrading to websocket");

    let manager = app.websocket.clone();
    ws.max_message_size(app.max_body_bytes)
        .on_upgrade(move |socket| async move { manager.serve_socket(socket, remote_addr).await })
}
