//! Websocket sessions.
//!
//! A websocket connection carries the same JSON-RPC methods as plain HTTP, plus `subscribe`,
//! `unsubscribe` and `unsubscribe_all`, which only make sense on a long-lived connection.  Inbound
//! messages are handled one at a time, in the order they arrive.  Events of each subscription are
//! forwarded by their own task into a bounded queue that the session drains into the socket.
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::StreamExt;
use futures::stream::BoxStream;
use inspect_jsonrpc::{
    ErrorDetails, Id, JsonRpcError, JsonValue, Message, Response, ResponsePayload, Router, Transport, TransportMetadata,
    parse_error_response,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::WebsocketConfig;
use crate::error::SubscriptionError;
use crate::subscription::{Event, EventBus, SubscriptionCleanup};

#[derive(Debug, thiserror::Error)]
pub enum WebsocketError {
    #[error("Websocket error")]
    Socket(#[from] axum::Error),

    #[error("Nothing read from peer in {}", humantime::format_duration(*.0))]
    ReadTimeout(Duration),

    #[error("Binary message is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
}

/// [`Transport`] over an upgraded axum websocket.
///
/// Pings and pongs are absorbed here; any frame read from the peer counts as a sign of life for
/// [`Transport::keepalive`].
pub struct WebsocketTransport {
    socket: WebSocket,
    remote_addr: SocketAddr,
    read_wait: Duration,
    last_read: Instant,
}

impl WebsocketTransport {
    pub fn new(socket: WebSocket, remote_addr: SocketAddr, read_wait: Duration) -> Self {
        Self {
            socket,
            remote_addr,
            read_wait,
            last_read: Instant::now(),
        }
    }
}

impl Transport for WebsocketTransport {
    type Error = WebsocketError;

    fn remote_peer(&self) -> Cow<'static, str> {
        self.remote_addr.to_string().into()
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            self.socket.send(WsMessage::Text(message.into())).await?;
            Ok(())
        }
    }

    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_ {
        async move {
            loop {
                let Some(message) = self.socket.recv().await else {
                    return Ok(None);
                };
                let message = message?;
                self.last_read = Instant::now();

                match message {
                    WsMessage::Text(text) => return Ok(Some(text.as_str().to_owned())),
                    WsMessage::Binary(bytes) => {
                        return String::from_utf8(bytes.to_vec())
                            .map(Some)
                            .map_err(WebsocketError::InvalidUtf8);
                    }
                    // axum answers pings itself
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                    WsMessage::Close(frame) => {
                        tracing::debug!(?frame, "Peer closed websocket");
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn keepalive(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            let idle = self.last_read.elapsed();
            if idle > self.read_wait {
                return Err(WebsocketError::ReadTimeout(idle));
            }

            self.socket.send(WsMessage::Ping(Bytes::new())).await?;
            Ok(())
        }
    }
}

/// The methods handled by the session itself rather than the route table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum SubscriptionMethod {
    Subscribe,
    Unsubscribe,
    UnsubscribeAll,
}

impl SubscriptionMethod {
    fn of(message: &Message) -> Option<Self> {
        let method = match message {
            Message::Request(request) => &request.method,
            Message::Notification(notification) => &notification.method,
            _ => return None,
        };

        Self::from_str(method).ok()
    }
}

#[derive(Deserialize)]
struct QueryParams {
    query: String,
}

/// Runs websocket sessions against a route table and an event bus.
#[derive(Clone)]
pub struct WebsocketManager<S: Clone + Send + Sync + 'static> {
    router: Router<S>,
    event_bus: Arc<dyn EventBus>,
    cleanup: SubscriptionCleanup,
    config: WebsocketConfig,
}

impl<S: Clone + Send + Sync + 'static> WebsocketManager<S> {
    pub fn new(router: Router<S>, event_bus: Arc<dyn EventBus>, config: WebsocketConfig) -> Self {
        Self {
            router,
            cleanup: SubscriptionCleanup::new(event_bus.clone()),
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &WebsocketConfig {
        &self.config
    }

    pub async fn serve_socket(&self, socket: WebSocket, remote_addr: SocketAddr) {
        self.run_session(WebsocketTransport::new(socket, remote_addr, self.config.read_wait))
            .await
    }

    /// Run a session until the peer disconnects or the transport fails, then release the
    /// session's subscriptions.
    pub async fn run_session<T: Transport>(&self, transport: T) {
        let remote = transport.remote_peer().into_owned();
        let span = tracing::info_span!("websocket_session", protocol = "websocket", remote_addr = %remote);

        let (events_tx, events_rx) = mpsc::channel(self.config.write_channel_capacity);
        let session = Session {
            manager: self,
            transport,
            metadata: Arc::new(TransportMetadata::new(remote.clone())),
            remote,
            subscriptions: HashMap::new(),
            cancel: CancellationToken::new(),
            forwarders: TaskTracker::new(),
            events_tx,
        };

        session.run(events_rx).instrument(span).await
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Transport(E),

    #[error("Timed out writing to peer after {}", humantime::format_duration(*.0))]
    WriteTimeout(Duration),

    #[error(transparent)]
    Encode(#[from] JsonRpcError),
}

struct Session<'a, S: Clone + Send + Sync + 'static, T: Transport> {
    manager: &'a WebsocketManager<S>,
    transport: T,
    metadata: Arc<TransportMetadata>,
    remote: String,
    /// Active subscriptions by query, each with the token that stops its forwarder.
    subscriptions: HashMap<String, CancellationToken>,
    cancel: CancellationToken,
    forwarders: TaskTracker,
    events_tx: mpsc::Sender<Response>,
}

impl<S: Clone + Send + Sync + 'static, T: Transport> Session<'_, S, T> {
    async fn run(mut self, mut events_rx: mpsc::Receiver<Response>) {
        tracing::debug!("Websocket session started");

        let ping_period = self.manager.config.ping_period;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = self.transport.receive_message() => {
                    match inbound {
                        Ok(Some(text)) => {
                            if let Some(reply) = self.handle_text(&text).await {
                                if let Err(e) = self.send(reply).await {
                                    tracing::debug!(err = %e, "Failed to send response; closing session");
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Peer disconnected");
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(err = %e, "Error receiving from peer; closing session");
                            break;
                        }
                    }
                },
                Some(event) = events_rx.recv() => {
                    if let Err(e) = self.send(Message::Response(event)).await {
                        tracing::debug!(err = %e, "Failed to send event; closing session");
                        break;
                    }
                },
                _ = ping.tick() => {
                    let write_wait = self.manager.config.write_wait;
                    match tokio::time::timeout(write_wait, self.transport.keepalive()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(err = %e, "Keepalive failed; closing session");
                            break;
                        }
                        Err(_) => {
                            tracing::debug!("Timed out sending ping; closing session");
                            break;
                        }
                    }
                }
            }
        }

        // Stop forwarding before the subscriptions are released, so no forwarder outlives its
        // subscription
        self.cancel.cancel();
        self.forwarders.close();
        self.forwarders.wait().await;

        self.manager.cleanup.on_disconnect(&self.remote).await;
        tracing::debug!("Websocket session ended");
    }

    async fn send(&mut self, message: Message) -> Result<(), SessionError<T::Error>> {
        let text = message.into_string()?;
        let write_wait = self.manager.config.write_wait;

        match tokio::time::timeout(write_wait, self.transport.send_message(text)).await {
            Ok(result) => result.map_err(SessionError::Transport),
            Err(_) => Err(SessionError::WriteTimeout(write_wait)),
        }
    }

    async fn handle_text(&mut self, text: &str) -> Option<Message> {
        match text.parse::<Message>() {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                tracing::debug!(err = %e, "Unparseable message from peer");
                Some(parse_error_response(e))
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Option<Message> {
        match message {
            // Batches that touch subscriptions are run one message at a time, so subscription
            // changes take effect in the order they were requested
            Message::Batch(messages) if messages.iter().any(|m| SubscriptionMethod::of(m).is_some()) => {
                let mut responses = Vec::with_capacity(messages.len());
                for message in messages {
                    let response = match message {
                        Message::Batch(_) => Some(Message::Response(Response::error(
                            Id::Null,
                            ErrorDetails::invalid_request("Nested batches are not allowed", None),
                        ))),
                        message => self.handle_single(message).await,
                    };
                    responses.extend(response);
                }
                (!responses.is_empty()).then_some(Message::Batch(responses))
            }
            message => self.handle_single(message).await,
        }
    }

    async fn handle_single(&mut self, message: Message) -> Option<Message> {
        match (SubscriptionMethod::of(&message), message) {
            (Some(method), Message::Request(request)) => {
                let payload = self.handle_subscription(method, Some(&request.id), request.params).await;
                Some(Message::Response(Response::new(request.id, payload)))
            }
            (Some(method), Message::Notification(notification)) => {
                self.handle_subscription(method, None, notification.params).await;
                None
            }
            (_, message) => {
                self.manager
                    .router
                    .handle_message(self.metadata.clone(), message)
                    .await
            }
        }
    }

    async fn handle_subscription(
        &mut self,
        method: SubscriptionMethod,
        id: Option<&Id>,
        params: Option<JsonValue>,
    ) -> ResponsePayload {
        let result = match method {
            SubscriptionMethod::Subscribe => match (id, query_param(params)) {
                (Some(id), Ok(query)) => self.subscribe(id, query).await,
                (None, _) => Err(ErrorDetails::invalid_request(
                    "subscribe must be invoked as a request, since events are addressed by its id",
                    None,
                )),
                (_, Err(details)) => Err(details),
            },
            SubscriptionMethod::Unsubscribe => match query_param(params) {
                Ok(query) => self.unsubscribe(query).await,
                Err(details) => Err(details),
            },
            SubscriptionMethod::UnsubscribeAll => self.unsubscribe_all().await,
        };

        match result {
            Ok(()) => ResponsePayload::success(json!({})),
            Err(details) => {
                let method: &'static str = method.into();
                tracing::debug!(method, error = %details.message, "Subscription request failed");
                ResponsePayload::error(details)
            }
        }
    }

    async fn subscribe(&mut self, id: &Id, query: String) -> Result<(), ErrorDetails> {
        if self.subscriptions.contains_key(&query) {
            return Err(SubscriptionError::AlreadySubscribed { query }.into());
        }

        let events = self
            .manager
            .event_bus
            .subscribe(&self.remote, &query, self.manager.config.write_channel_capacity)
            .await?;

        let token = self.cancel.child_token();
        self.subscriptions.insert(query.clone(), token.clone());
        tracing::debug!(query = %query, "Subscribed");

        self.forwarders
            .spawn(forward_events(events, event_id(id), query, self.events_tx.clone(), token));

        Ok(())
    }

    async fn unsubscribe(&mut self, query: String) -> Result<(), ErrorDetails> {
        self.manager.event_bus.unsubscribe(&self.remote, &query).await?;

        if let Some(token) = self.subscriptions.remove(&query) {
            token.cancel();
        }
        tracing::debug!(query = %query, "Unsubscribed");

        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<(), ErrorDetails> {
        self.manager.event_bus.unsubscribe_all(&self.remote).await?;

        for (_query, token) in self.subscriptions.drain() {
            token.cancel();
        }
        tracing::debug!("Unsubscribed from everything");

        Ok(())
    }
}

/// `subscribe`/`unsubscribe` take a single `query` param, by name or position.
fn query_param(params: Option<JsonValue>) -> Result<String, ErrorDetails> {
    let params = match params {
        Some(JsonValue::Array(mut values)) if values.len() == 1 => json!({ "query": values.remove(0) }),
        Some(params) => params,
        None => JsonValue::Null,
    };

    serde_json::from_value::<QueryParams>(params.clone())
        .map(|params| params.query)
        .map_err(|e| ErrorDetails::invalid_params(format!("Invalid params: {e}"), params))
}

/// Events of a subscription are delivered as responses to the subscribe request, with `#event`
/// appended to its id.
fn event_id(id: &Id) -> Id {
    match id {
        Id::Str(s) => Id::Str(format!("{s}#event")),
        Id::Number(n) => Id::Str(format!("{n}#event")),
        Id::Null => Id::Str("#event".to_string()),
    }
}

async fn forward_events(
    mut events: BoxStream<'static, Event>,
    id: Id,
    query: String,
    sink: mpsc::Sender<Response>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => {
                    tracing::debug!(query = %query, "Event stream ended");
                    break;
                }
            },
        };

        let response = Response::success(
            id.clone(),
            json!({
                "query": query,
                "data": event.data,
                "events": event.events,
            }),
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(response) => if sent.is_err() {
                break;
            },
        }
    }
}
