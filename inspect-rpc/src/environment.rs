use async_trait::async_trait;

use crate::error::QueryResult;
use crate::query::*;

/// The read-only capabilities the inspection methods are answered from: the block store, the
/// state store and the transaction/block indexers of a stopped node.
///
/// The server never looks inside an environment; it only hands each decoded request to the
/// matching method here.  Implementations must be safe to call from many connections at once.
#[async_trait]
pub trait QueryEnvironment: Send + Sync + 'static {
    /// Block metadata for an inclusive height range, newest first.
    async fn blockchain(&self, params: BlockchainParams) -> QueryResult<BlockchainInfo>;

    async fn consensus_params(&self, params: HeightParams) -> QueryResult<ConsensusParamsInfo>;

    async fn block(&self, params: HeightParams) -> QueryResult<BlockInfo>;

    async fn block_by_hash(&self, params: HashParams) -> QueryResult<BlockInfo>;

    async fn block_results(&self, params: HeightParams) -> QueryResult<BlockResults>;

    async fn commit(&self, params: HeightParams) -> QueryResult<CommitInfo>;

    async fn validators(&self, params: ValidatorsParams) -> QueryResult<ValidatorsInfo>;

    async fn tx(&self, params: TxParams) -> QueryResult<TxInfo>;

    async fn tx_search(&self, params: TxSearchParams) -> QueryResult<TxSearchResults>;

    async fn block_search(&self, params: BlockSearchParams) -> QueryResult<BlockSearchResults>;
}
