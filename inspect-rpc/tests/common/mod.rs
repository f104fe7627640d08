//! A canned ledger and a recording event bus shared by the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use inspect_rpc::query::*;
use inspect_rpc::{
    Event, EventBus, LocalEventBus, QueryEnvironment, QueryError, QueryResult, RpcConfig, Server, SubscriptionError,
};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

/// Height of the newest block in the canned ledger.
pub const LATEST_HEIGHT: i64 = 100;

/// A ledger of blocks `1..=LATEST_HEIGHT` that records every query it answers.
///
/// `block` at height 42 sleeps for [`MockEnvironment::SLOW_BLOCK_DELAY`], for tests that need a
/// request in flight.
#[derive(Default)]
pub struct MockEnvironment {
    calls: Mutex<Vec<(&'static str, JsonValue)>>,
}

impl MockEnvironment {
    pub const SLOW_BLOCK_HEIGHT: i64 = 42;
    pub const SLOW_BLOCK_DELAY: Duration = Duration::from_millis(300);

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(&'static str, JsonValue)> {
        self.calls.lock().unwrap().clone()
    }

    fn record<T: Serialize>(&self, method: &'static str, params: &T) {
        self.calls
            .lock()
            .unwrap()
            .push((method, serde_json::to_value(params).unwrap()));
    }

    fn height(height: Option<i64>) -> QueryResult<i64> {
        match height.unwrap_or(LATEST_HEIGHT) {
            height if height <= 0 => Err(QueryError::InvalidArgument(format!(
                "height must be greater than 0, but got {height}"
            ))),
            height if height > LATEST_HEIGHT => Err(QueryError::NotFound(format!(
                "height {height} must be less than or equal to the current blockchain height {LATEST_HEIGHT}"
            ))),
            height => Ok(height),
        }
    }

    fn block_at(height: i64) -> BlockInfo {
        BlockInfo {
            block_id: json!({ "hash": format!("{height:064X}") }),
            block: json!({ "header": { "height": height.to_string() } }),
        }
    }
}

#[async_trait]
impl QueryEnvironment for MockEnvironment {
    async fn blockchain(&self, params: BlockchainParams) -> QueryResult<BlockchainInfo> {
        self.record("blockchain", &params);
        let max = Self::height(params.max_height)?;
        let min = params.min_height.unwrap_or(1).max(1);

        Ok(BlockchainInfo {
            last_height: LATEST_HEIGHT,
            block_metas: (min..=max).rev().map(|height| json!({ "height": height })).collect(),
        })
    }

    async fn consensus_params(&self, params: HeightParams) -> QueryResult<ConsensusParamsInfo> {
        self.record("consensus_params", &params);
        Ok(ConsensusParamsInfo {
            block_height: Self::height(params.height)?,
            consensus_params: json!({ "block": { "max_bytes": "22020096" } }),
        })
    }

    async fn block(&self, params: HeightParams) -> QueryResult<BlockInfo> {
        self.record("block", &params);
        let height = Self::height(params.height)?;
        if height == Self::SLOW_BLOCK_HEIGHT {
            tokio::time::sleep(Self::SLOW_BLOCK_DELAY).await;
        }

        Ok(Self::block_at(height))
    }

    async fn block_by_hash(&self, params: HashParams) -> QueryResult<BlockInfo> {
        self.record("block_by_hash", &params);
        (1..=LATEST_HEIGHT)
            .map(Self::block_at)
            .find(|block| block.block_id["hash"] == params.hash.to_uppercase().trim_start_matches("0X"))
            .ok_or_else(|| QueryError::NotFound(format!("block with hash {}", params.hash)))
    }

    async fn block_results(&self, params: HeightParams) -> QueryResult<BlockResults> {
        self.record("block_results", &params);
        Ok(BlockResults {
            height: Self::height(params.height)?,
            ..Default::default()
        })
    }

    async fn commit(&self, params: HeightParams) -> QueryResult<CommitInfo> {
        self.record("commit", &params);
        let height = Self::height(params.height)?;

        Ok(CommitInfo {
            signed_header: json!({ "header": { "height": height.to_string() } }),
            canonical: height < LATEST_HEIGHT,
        })
    }

    async fn validators(&self, params: ValidatorsParams) -> QueryResult<ValidatorsInfo> {
        self.record("validators", &params);
        Ok(ValidatorsInfo {
            block_height: Self::height(params.height)?,
            validators: vec![json!({ "voting_power": "10" })],
            count: 1,
            total: 1,
        })
    }

    async fn tx(&self, params: TxParams) -> QueryResult<TxInfo> {
        self.record("tx", &params);
        Err(QueryError::NotFound(format!("tx ({}) not found", params.hash)))
    }

    async fn tx_search(&self, params: TxSearchParams) -> QueryResult<TxSearchResults> {
        self.record("tx_search", &params);
        Ok(TxSearchResults::default())
    }

    async fn block_search(&self, params: BlockSearchParams) -> QueryResult<BlockSearchResults> {
        self.record("block_search", &params);
        Err(QueryError::Unavailable("block indexing is disabled".to_string()))
    }
}

/// A [`LocalEventBus`] that also records who asked it to `unsubscribe_all`.
#[derive(Default)]
pub struct RecordingEventBus {
    inner: LocalEventBus,
    unsubscribed_all: Mutex<Vec<String>>,
}

impl RecordingEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unsubscribed_all(&self) -> Vec<String> {
        self.unsubscribed_all.lock().unwrap().clone()
    }

    pub fn publish(&self, query: &str, data: JsonValue) -> usize {
        self.inner.publish(
            query,
            Event {
                data,
                events: BTreeMap::from([("tm.event".to_string(), vec!["NewBlock".to_string()])]),
            },
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn subscribe(
        &self,
        subscriber: &str,
        query: &str,
        capacity: usize,
    ) -> Result<BoxStream<'static, Event>, SubscriptionError> {
        self.inner.subscribe(subscriber, query, capacity).await
    }

    async fn unsubscribe(&self, subscriber: &str, query: &str) -> Result<(), SubscriptionError> {
        self.inner.unsubscribe(subscriber, query).await
    }

    async fn unsubscribe_all(&self, subscriber: &str) -> Result<(), SubscriptionError> {
        self.unsubscribed_all.lock().unwrap().push(subscriber.to_string());
        self.inner.unsubscribe_all(subscriber).await
    }
}

/// Config listening on an ephemeral localhost port.
pub fn test_config() -> RpcConfig {
    RpcConfig {
        listen_address: "tcp://127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

pub fn test_handler(config: &RpcConfig, env: Arc<MockEnvironment>, bus: Arc<RecordingEventBus>) -> axum::Router {
    inspect_rpc::handler(config, inspect_rpc::routes(env), bus).unwrap()
}

pub fn test_server(config: RpcConfig, env: Arc<MockEnvironment>, bus: Arc<RecordingEventBus>) -> Server {
    let handler = test_handler(&config, env, bus);
    Server::new(config, handler)
}
