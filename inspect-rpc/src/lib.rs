//! A read-only JSON-RPC server for inspecting the persisted ledger of a stopped node.
//!
//! The server answers a fixed set of historical queries (`block`, `tx`, `validators`, ...) from a
//! [`QueryEnvironment`] over HTTP, the URI form of JSON-RPC, and websockets.  It never writes to
//! the stores it reads, and it exposes nothing that would change node state.
//!
//! Putting it together:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(env: Arc<dyn inspect_rpc::QueryEnvironment>) -> inspect_rpc::Result<()> {
//! let config = inspect_rpc::RpcConfig::load("rpc.yaml")?;
//! let routes = inspect_rpc::routes(env);
//! let handler = inspect_rpc::handler(&config, routes, Arc::new(inspect_rpc::LocalEventBus::new()))?;
//!
//! let cancel = tokio_util::sync::CancellationToken::new();
//! inspect_rpc::Server::new(config, handler).run(cancel).await
//! # }
//! ```

mod config;
mod environment;
mod error;
mod handler;
pub mod query;
mod routes;
mod server;
mod subscription;
#[cfg(test)]
pub mod testing;
mod tls;
mod websocket;

pub use config::{
    DEFAULT_LISTEN_ADDRESS, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES, DEFAULT_READ_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, RpcConfig, ShutdownPolicy, TransportConfig, WebsocketConfig, effective_write_timeout,
};
pub use environment::QueryEnvironment;
pub use error::{ConfigError, QueryError, QueryResult, Result, ServerError, SubscriptionError};
pub use handler::{Pipeline, Stage, handler};
pub use routes::{Environment, Method, routes};
pub use server::{Listener, Server};
pub use subscription::{Event, EventBus, LocalEventBus, SubscriptionCleanup};
pub use tls::{acceptor as tls_acceptor, server_config as tls_server_config};
pub use websocket::{WebsocketError, WebsocketManager, WebsocketTransport};
