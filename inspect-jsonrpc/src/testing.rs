//! Helpers for testing the JSON RPC implementation and the servers built on it.
//!
//! This module is only compiled for tests.
#![allow(dead_code)]

use futures::channel::mpsc;
use futures::StreamExt;

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "debug,hyper=info,h2=info";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        // Another test harness may have already set a global subscriber; that's fine
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init();
    });
}

/// A pair of in-memory transports connected to each other, built on the (stream, sink) impl of
/// `Transport`.
pub type TestTransport = (
    futures::stream::Map<mpsc::Receiver<String>, fn(String) -> Result<String, std::io::Error>>,
    mpsc::Sender<String>,
);

pub fn setup_test_channel() -> (TestTransport, TestTransport) {
    let (client_tx, server_rx) = mpsc::channel(16);
    let (server_tx, client_rx) = mpsc::channel(16);

    let ok: fn(String) -> Result<String, std::io::Error> = Ok;

    ((client_rx.map(ok), client_tx), (server_rx.map(ok), server_tx))
}
