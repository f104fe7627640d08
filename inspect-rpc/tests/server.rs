//! End-to-end tests against a real listener.

#[path = "../src/testing.rs"]
mod test_helpers;
mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use common::{MockEnvironment, RecordingEventBus, test_config, test_server};
use futures::{SinkExt, StreamExt};
use inspect_rpc::{Result, RpcConfig, Server, ServerError, ShutdownPolicy};
use serde_json::{Value as JsonValue, json};
use test_helpers::{data_file, init_test_logging};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    async fn start(server: Server) -> Self {
        init_test_logging();

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { server.serve(listener, cancel).await }
        });

        Self { addr, cancel, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        tokio::time::timeout(SHUTDOWN_TIMEOUT, self.handle)
            .await
            .expect("server did not stop after cancellation")
            .unwrap()
    }
}

#[tokio::test]
async fn block_at_height_reaches_the_adapter() {
    let env = MockEnvironment::new();
    let server = RunningServer::start(test_server(test_config(), env.clone(), RecordingEventBus::new())).await;

    let body: JsonValue = reqwest::get(server.url("/block?height=100"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"], json!(-1));
    assert_eq!(body["result"]["block"]["header"]["height"], json!("100"));

    let body: JsonValue = reqwest::Client::new()
        .post(server.url("/"))
        .json(&json!({"jsonrpc": "2.0", "id": "x", "method": "block", "params": {"height": 100}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"], json!("x"));

    assert_eq!(
        env.calls(),
        vec![("block", json!({"height": 100})), ("block", json!({"height": 100}))]
    );

    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
}

#[tokio::test]
async fn cancellation_after_start_returns_listener_closed() {
    init_test_logging();
    let server = test_server(test_config(), MockEnvironment::new(), RecordingEventBus::new());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { server.listen_and_serve(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.unwrap().unwrap();
    assert_matches!(result, Err(ServerError::ListenerClosed));
}

#[tokio::test]
async fn in_flight_requests_complete_after_cancellation() {
    let server = RunningServer::start(test_server(test_config(), MockEnvironment::new(), RecordingEventBus::new())).await;
    let addr = server.addr;

    let request = tokio::spawn(reqwest::get(server.url(&format!(
        "/block?height={}",
        MockEnvironment::SLOW_BLOCK_HEIGHT
    ))));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(
        body["result"]["block"]["header"]["height"],
        json!(MockEnvironment::SLOW_BLOCK_HEIGHT.to_string())
    );
}

#[tokio::test]
async fn drain_policy_waits_for_in_flight_requests() {
    let server = test_server(test_config(), MockEnvironment::new(), RecordingEventBus::new())
        .with_shutdown_policy(ShutdownPolicy::Drain {
            timeout: Duration::from_secs(3),
        });
    let server = RunningServer::start(server).await;

    let started = Instant::now();
    let request = tokio::spawn(reqwest::get(server.url(&format!(
        "/block?height={}",
        MockEnvironment::SLOW_BLOCK_HEIGHT
    ))));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
    assert!(started.elapsed() >= MockEnvironment::SLOW_BLOCK_DELAY);

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn serves_over_tls() {
    init_test_logging();
    let server = test_server(test_config(), MockEnvironment::new(), RecordingEventBus::new());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().port();
    let acceptor = inspect_rpc::tls_acceptor(&data_file("localhost.crt"), &data_file("localhost.key")).unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { server.serve_tls(listener, cancel, acceptor).await }
    });

    let ca = reqwest::Certificate::from_pem(&std::fs::read(data_file("ca.crt")).unwrap()).unwrap();
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(ca)
        .build()
        .unwrap();

    let body: JsonValue = client
        .get(format!("https://localhost:{port}/commit?height=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"]["signed_header"]["header"]["height"], json!("5"));

    cancel.cancel();
    let result = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.unwrap().unwrap();
    assert_matches!(result, Err(ServerError::ListenerClosed));
}

#[tokio::test]
async fn header_limit_applies_to_http1_and_http2() {
    init_test_logging();
    let config = RpcConfig {
        max_header_bytes: 8 * 1024,
        ..test_config()
    };
    let server = test_server(config, MockEnvironment::new(), RecordingEventBus::new());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().port();
    let acceptor = inspect_rpc::tls_acceptor(&data_file("localhost.crt"), &data_file("localhost.key")).unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { server.serve_tls(listener, cancel, acceptor).await }
    });

    let client = |http2: bool| {
        let ca = reqwest::Certificate::from_pem(&std::fs::read(data_file("ca.crt")).unwrap()).unwrap();
        let builder = reqwest::Client::builder().use_rustls_tls().add_root_certificate(ca);
        let builder = if http2 {
            builder.http2_prior_knowledge()
        } else {
            builder.http1_only()
        };
        builder.build().unwrap()
    };
    let url = format!("https://localhost:{port}/block?height=5");
    let padding = "x".repeat(12 * 1024);

    for (http2, version) in [(true, reqwest::Version::HTTP_2), (false, reqwest::Version::HTTP_11)] {
        let client = client(http2);

        let small = client.get(&url).send().await.unwrap();
        assert_eq!(small.status(), reqwest::StatusCode::OK);
        assert_eq!(small.version(), version);

        // Refused either by the server with a 431 or by an h2 client honoring the advertised limit
        match client.get(&url).header("x-padding", &padding).send().await {
            Ok(response) => assert_eq!(
                response.status(),
                reqwest::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "{version:?}"
            ),
            Err(e) => assert!(http2, "HTTP/1.1 request failed instead of getting a 431: {e}"),
        }
    }

    cancel.cancel();
    let result = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.unwrap().unwrap();
    assert_matches!(result, Err(ServerError::ListenerClosed));
}

#[tokio::test]
async fn tls_files_are_checked_before_binding() {
    init_test_logging();
    let config = RpcConfig {
        tls_cert_file: Some(data_file("missing.crt")),
        tls_key_file: Some(data_file("localhost.key")),
        ..test_config()
    };
    let server = test_server(config, MockEnvironment::new(), RecordingEventBus::new());

    assert_matches!(
        server.run(CancellationToken::new()).await,
        Err(ServerError::TlsCertificate { .. })
    );
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(ws: &mut WsStream) -> JsonValue {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a websocket message")
            .expect("websocket closed")
            .unwrap();

        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsStream, message: JsonValue) {
    ws.send(WsMessage::text(message.to_string())).await.unwrap();
}

fn client_addr(ws: &WsStream) -> SocketAddr {
    match ws.get_ref() {
        tokio_tungstenite::MaybeTlsStream::Plain(stream) => stream.local_addr().unwrap(),
        _ => panic!("expected a plain TCP websocket"),
    }
}

#[tokio::test]
async fn websocket_subscription_is_released_on_disconnect() {
    let bus = RecordingEventBus::new();
    let server = RunningServer::start(test_server(test_config(), MockEnvironment::new(), bus.clone())).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/websocket", server.addr))
        .await
        .unwrap();
    let client = client_addr(&ws);

    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": 7, "method": "subscribe", "params": {"query": "tm.event='NewBlock'"}}),
    )
    .await;
    assert_eq!(next_json(&mut ws).await, json!({"jsonrpc": "2.0", "id": 7, "result": {}}));

    // Routed methods work over the same socket
    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": 8, "method": "commit", "params": {"height": 99}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["id"], json!(8));
    assert_eq!(reply["result"]["canonical"], json!(true));

    assert_eq!(bus.publish("tm.event='NewBlock'", json!({"height": 101})), 1);
    let event = next_json(&mut ws).await;
    assert_eq!(event["id"], json!("7#event"));
    assert_eq!(event["result"]["query"], json!("tm.event='NewBlock'"));
    assert_eq!(event["result"]["data"], json!({"height": 101}));

    ws.close(None).await.unwrap();
    drop(ws);

    let deadline = Instant::now() + Duration::from_secs(5);
    while bus.unsubscribed_all().is_empty() {
        assert!(Instant::now() < deadline, "subscriptions were not released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Give a duplicate cleanup a chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(bus.unsubscribed_all(), vec![client.to_string()]);
    assert_eq!(bus.subscriber_count(), 0);

    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
}

#[tokio::test]
async fn drain_policy_leaves_websocket_sessions_running() {
    let server = test_server(test_config(), MockEnvironment::new(), RecordingEventBus::new())
        .with_shutdown_policy(ShutdownPolicy::Drain {
            timeout: Duration::from_secs(3),
        });
    let server = RunningServer::start(server).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/websocket", server.addr))
        .await
        .unwrap();

    let started = Instant::now();
    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
    assert!(started.elapsed() < Duration::from_secs(3), "shutdown waited on the websocket");

    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": 1, "method": "commit", "params": {"height": 99}}),
    )
    .await;
    assert_eq!(next_json(&mut ws).await["id"], json!(1));
}

#[tokio::test]
async fn connection_limit_queues_excess_clients() {
    let config = RpcConfig {
        max_open_connections: 1,
        ..test_config()
    };
    let server = RunningServer::start(test_server(config, MockEnvironment::new(), RecordingEventBus::new())).await;

    // Holds the only slot until it is closed
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/websocket", server.addr))
        .await
        .unwrap();

    let queued = tokio::spawn(reqwest::get(server.url("/block?height=1")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!queued.is_finished());

    ws.close(None).await.unwrap();
    drop(ws);

    let response = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
}

#[tokio::test]
async fn shared_handler_serves_concurrent_clients() {
    let env = MockEnvironment::new();
    let server = RunningServer::start(test_server(test_config(), env.clone(), RecordingEventBus::new())).await;
    let client = reqwest::Client::new();

    let requests = (1..=20).map(|height| {
        let client = client.clone();
        let url = server.url(&format!("/commit?height={height}"));
        async move { client.get(url).send().await.unwrap().json::<JsonValue>().await.unwrap() }
    });
    let bodies = futures::future::join_all(requests).await;

    for (height, body) in (1..=20).zip(bodies) {
        assert_eq!(body["result"]["signed_header"]["header"]["height"], json!(height.to_string()));
    }
    assert_eq!(env.calls().len(), 20);

    assert_matches!(server.shutdown().await, Err(ServerError::ListenerClosed));
}
