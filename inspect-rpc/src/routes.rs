//! The method table of the inspection server.
use std::sync::Arc;

use inspect_jsonrpc::{MethodSpec, Params, Router, State};
use strum::IntoEnumIterator;

use crate::environment::QueryEnvironment;
use crate::error::QueryResult;
use crate::query::*;

/// The environment every route is answered from.
pub type Environment = Arc<dyn QueryEnvironment>;

/// Every method the inspection server answers.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Method {
    Blockchain,
    ConsensusParams,
    Block,
    BlockByHash,
    BlockResults,
    Commit,
    Validators,
    Tx,
    TxSearch,
    BlockSearch,
}

impl Method {
    /// Parameter names, in positional order.
    pub const fn params(self) -> &'static [&'static str] {
        match self {
            Method::Blockchain => &["minHeight", "maxHeight"],
            Method::ConsensusParams | Method::Block | Method::BlockResults | Method::Commit => &["height"],
            Method::BlockByHash => &["hash"],
            Method::Validators => &["height", "page", "per_page"],
            Method::Tx => &["hash", "prove"],
            Method::TxSearch => &["query", "prove", "page", "per_page", "order_by"],
            Method::BlockSearch => &["query", "page", "per_page", "order_by"],
        }
    }

    /// Lookups of historical data never change once answered; searches may.
    pub const fn cacheable(self) -> bool {
        !matches!(self, Method::TxSearch | Method::BlockSearch)
    }

    pub const fn spec(self) -> MethodSpec {
        MethodSpec::new(self.params(), self.cacheable())
    }
}

/// Build the route table over `env`.
///
/// The table holds exactly one entry per [`Method`].
pub fn routes(env: Environment) -> Router<Environment> {
    let mut router = Router::new_with_state(env);

    for method in Method::iter() {
        let name: &'static str = method.into();
        let spec = method.spec();

        match method {
            Method::Blockchain => router.register_method(name, spec, blockchain),
            Method::ConsensusParams => router.register_method(name, spec, consensus_params),
            Method::Block => router.register_method(name, spec, block),
            Method::BlockByHash => router.register_method(name, spec, block_by_hash),
            Method::BlockResults => router.register_method(name, spec, block_results),
            Method::Commit => router.register_method(name, spec, commit),
            Method::Validators => router.register_method(name, spec, validators),
            Method::Tx => router.register_method(name, spec, tx),
            Method::TxSearch => router.register_method(name, spec, tx_search),
            Method::BlockSearch => router.register_method(name, spec, block_search),
        }
    }

    router
}

async fn blockchain(
    State(env): State<Environment>,
    Params(params): Params<BlockchainParams>,
) -> QueryResult<BlockchainInfo> {
    env.blockchain(params).await
}

async fn consensus_params(
    State(env): State<Environment>,
    Params(params): Params<HeightParams>,
) -> QueryResult<ConsensusParamsInfo> {
    env.consensus_params(params).await
}

async fn block(State(env): State<Environment>, Params(params): Params<HeightParams>) -> QueryResult<BlockInfo> {
    env.block(params).await
}

async fn block_by_hash(State(env): State<Environment>, Params(params): Params<HashParams>) -> QueryResult<BlockInfo> {
    env.block_by_hash(params).await
}

async fn block_results(
    State(env): State<Environment>,
    Params(params): Params<HeightParams>,
) -> QueryResult<BlockResults> {
    env.block_results(params).await
}

async fn commit(State(env): State<Environment>, Params(params): Params<HeightParams>) -> QueryResult<CommitInfo> {
    env.commit(params).await
}

async fn validators(
    State(env): State<Environment>,
    Params(params): Params<ValidatorsParams>,
) -> QueryResult<ValidatorsInfo> {
    env.validators(params).await
}

async fn tx(State(env): State<Environment>, Params(params): Params<TxParams>) -> QueryResult<TxInfo> {
    env.tx(params).await
}

async fn tx_search(
    State(env): State<Environment>,
    Params(params): Params<TxSearchParams>,
) -> QueryResult<TxSearchResults> {
    env.tx_search(params).await
}

async fn block_search(
    State(env): State<Environment>,
    Params(params): Params<BlockSearchParams>,
) -> QueryResult<BlockSearchResults> {
    env.block_search(params).await
}
