//! Typed parameters and results of the inspection methods.
//!
//! Parameter structs serialize with exactly the names (and in the order) the methods declare, and
//! deserialize leniently: integers may be given as JSON numbers or decimal strings, and an empty
//! string means "not given".
//!
//! Result payloads that mirror ledger data structures (blocks, commits, validator sets, ...) are
//! carried as opaque JSON.  Their encoding belongs to the stores behind
//! [`crate::QueryEnvironment`], not to the server.
use std::str::FromStr;

use inspect_jsonrpc::JsonValue;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// `blockchain` parameters: an inclusive height range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainParams {
    #[serde(rename = "minHeight", default, deserialize_with = "opt_i64")]
    pub min_height: Option<i64>,
    #[serde(rename = "maxHeight", default, deserialize_with = "opt_i64")]
    pub max_height: Option<i64>,
}

/// Parameters of the methods that look something up at a height.  `None` means the latest
/// height.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightParams {
    #[serde(default, deserialize_with = "opt_i64")]
    pub height: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    /// Hex encoded block hash.
    pub hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorsParams {
    #[serde(default, deserialize_with = "opt_i64")]
    pub height: Option<i64>,
    #[serde(default, deserialize_with = "opt_i64")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "opt_i64")]
    pub per_page: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParams {
    /// Hex encoded transaction hash.
    pub hash: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub prove: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSearchParams {
    pub query: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub prove: bool,
    #[serde(default, deserialize_with = "opt_i64")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "opt_i64")]
    pub per_page: Option<i64>,
    #[serde(default, deserialize_with = "opt_order_by")]
    pub order_by: Option<OrderBy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSearchParams {
    pub query: String,
    #[serde(default, deserialize_with = "opt_i64")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "opt_i64")]
    pub per_page: Option<i64>,
    #[serde(default, deserialize_with = "opt_order_by")]
    pub order_by: Option<OrderBy>,
}

/// Sort order of search results, by height.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OrderBy {
    Asc,
    Desc,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString<T> {
    Number(T),
    String(String),
}

fn opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<NumberOrString<i64>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) if s.is_empty() => Ok(None),
        Some(NumberOrString::String(s)) => i64::from_str(&s)
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid integer '{s}'"))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Option::<NumberOrString<bool>>::deserialize(deserializer)? {
        None => Ok(false),
        Some(NumberOrString::Number(b)) => Ok(b),
        Some(NumberOrString::String(s)) if s.is_empty() => Ok(false),
        Some(NumberOrString::String(s)) => {
            bool::from_str(&s).map_err(|_| de::Error::custom(format!("invalid boolean '{s}'")))
        }
    }
}

fn opt_order_by<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<OrderBy>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => OrderBy::from_str(&s)
            .map(Some)
            .map_err(|_| de::Error::custom(format!("order_by must be \"asc\" or \"desc\", got '{s}'"))),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub last_height: i64,
    pub block_metas: Vec<JsonValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusParamsInfo {
    pub block_height: i64,
    pub consensus_params: JsonValue,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: JsonValue,
    pub block: JsonValue,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockResults {
    pub height: i64,
    pub txs_results: Vec<JsonValue>,
    pub finalize_block_events: Vec<JsonValue>,
    pub validator_updates: Vec<JsonValue>,
    pub consensus_param_updates: Option<JsonValue>,
    pub app_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub signed_header: JsonValue,
    /// Whether the commit is the canonical one, as opposed to the one seen locally for the latest
    /// height.
    pub canonical: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorsInfo {
    pub block_height: i64,
    pub validators: Vec<JsonValue>,
    pub count: i64,
    pub total: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TxInfo {
    pub hash: String,
    pub height: i64,
    pub index: u32,
    pub tx_result: JsonValue,
    /// Base64 encoded transaction bytes.
    pub tx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<JsonValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TxSearchResults {
    pub txs: Vec<TxInfo>,
    pub total_count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockSearchResults {
    pub blocks: Vec<BlockInfo>,
    pub total_count: i64,
}
