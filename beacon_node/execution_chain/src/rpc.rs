//! The interface to an execution node that the service is written against.
//!
//! `HttpJsonRpc` implements it over JSON-RPC, `test_utils::MockExecutionNode` in memory.

use async_trait::async_trait;
use serde_json::{json, Value};
use types::{Address, Hash256, H256};

/// `keccak("DepositEvent(bytes,bytes,bytes,bytes,bytes)")`
pub const DEPOSIT_EVENT_TOPIC: Hash256 = H256([
    0x64, 0x9b, 0xbc, 0x62, 0xd0, 0xe3, 0x13, 0x42, 0xaf, 0xea, 0x4e, 0x5c, 0xd8, 0x2d, 0x40, 0x49,
    0xe7, 0xe1, 0xee, 0x91, 0x2f, 0xc0, 0x88, 0x9a, 0xa7, 0x90, 0x80, 0x3b, 0xe3, 0x90, 0x38, 0xc5,
]);
/// `keccak("get_deposit_count()")[0..4]`
pub const DEPOSIT_COUNT_FN_SIGNATURE: &str = "0x621fd130";
/// Number of bytes in deposit contract deposit count response.
pub const DEPOSIT_COUNT_RESPONSE_BYTES: usize = 96;

pub const ETH_GET_BLOCK_BY_NUMBER: &str = "eth_getBlockByNumber";
pub const ETH_GET_BLOCK_BY_HASH: &str = "eth_getBlockByHash";
pub const ETH_GET_LOGS: &str = "eth_getLogs";
pub const ETH_CALL: &str = "eth_call";

#[derive(Debug, PartialEq, Clone)]
pub enum RpcError {
    /// The request could not be sent or the response could not be read.
    Request(String),
    Json(String),
    /// The node answered with a JSON-RPC error object.
    ServerMessage { code: i64, message: String },
    /// The node answered, but not with what was asked for.
    InvalidResponse(String),
    BlockNotFound(String),
}

impl RpcError {
    /// Returns `true` if the node refused a log query because it would return too much data.
    ///
    /// Nodes word this differently, so the check is a substring match against `patterns`.
    pub fn is_too_much_data(&self, patterns: &[String]) -> bool {
        let message = match self {
            RpcError::ServerMessage { message, .. } => message,
            RpcError::Request(message) => message,
            _ => return false,
        };
        patterns
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        RpcError::Request(format!("{:?}", e))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Json(format!("{:?}", e))
    }
}

/// The header fields the service relies upon.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: Hash256,
    pub parent_hash: Hash256,
    pub timestamp: u64,
}

impl BlockHeader {
    /// Parses the object returned by `eth_getBlockBy*`.
    pub fn from_json(value: &Value) -> Result<Self, RpcError> {
        if value.is_null() {
            return Err(RpcError::BlockNotFound("null block".to_string()));
        }
        Ok(Self {
            number: hex_to_u64_be(json_str(value, "number")?)?,
            hash: hex_to_hash(json_str(value, "hash")?)?,
            parent_hash: hex_to_hash(json_str(value, "parentHash")?)?,
            timestamp: hex_to_u64_be(json_str(value, "timestamp")?)?,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "number": format!("0x{:x}", self.number),
            "hash": format!("{:?}", self.hash),
            "parentHash": format!("{:?}", self.parent_hash),
            "timestamp": format!("0x{:x}", self.timestamp),
        })
    }
}

/// A contract log, as returned by `eth_getLogs`.
#[derive(Debug, PartialEq, Clone)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: Hash256,
    pub log_index: u64,
    pub removed: bool,
}

impl Log {
    pub fn from_json(value: &Value) -> Result<Self, RpcError> {
        let address = hex_to_bytes(json_str(value, "address")?)?;
        if address.len() != 20 {
            return Err(RpcError::InvalidResponse(format!(
                "Log address was not 20 bytes: {:?}",
                address
            )));
        }
        let topics = value
            .get("topics")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::InvalidResponse("No topics in log".to_string()))?
            .iter()
            .map(|topic| {
                topic
                    .as_str()
                    .ok_or_else(|| RpcError::InvalidResponse("Topic was not string".to_string()))
                    .and_then(hex_to_hash)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            address: Address::from_slice(&address),
            topics,
            data: hex_to_bytes(json_str(value, "data")?)?,
            block_number: hex_to_u64_be(json_str(value, "blockNumber")?)?,
            block_hash: hex_to_hash(json_str(value, "blockHash")?)?,
            log_index: hex_to_u64_be(json_str(value, "logIndex")?)?,
            removed: value
                .get("removed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Selects logs emitted by `addresses` in the inclusive block range `from_block..=to_block`.
#[derive(Debug, PartialEq, Clone)]
pub struct FilterQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
}

impl FilterQuery {
    pub fn to_json(&self) -> Value {
        let addresses = self
            .addresses
            .iter()
            .map(|address| format!("{:?}", address))
            .collect::<Vec<_>>();
        json!([{
            "address": addresses,
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
        }])
    }
}

/// One call of a JSON-RPC batch. `result` and `error` are filled in by `ExecutionRpc::batch_call`.
#[derive(Debug, Clone)]
pub struct BatchElem {
    pub method: &'static str,
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

impl BatchElem {
    pub fn header_by_number(number: u64) -> Self {
        Self {
            method: ETH_GET_BLOCK_BY_NUMBER,
            params: json!([format!("0x{:x}", number), false]),
            result: None,
            error: None,
        }
    }
}

#[async_trait]
pub trait ExecutionRpc: Send + Sync + 'static {
    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, RpcError>;

    /// Returns the header at `number`, or the head when `number` is `None`.
    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError>;

    async fn header_by_hash(&self, hash: Hash256) -> Result<BlockHeader, RpcError>;

    /// Sends every element in a single round trip. A failure of one element is recorded in that
    /// element; `Err` means the batch as a whole failed.
    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), RpcError>;

    /// Calls `get_deposit_count()` on the deposit contract at `block` (the head if `None`).
    async fn deposit_count(&self, address: Address, block: Option<u64>) -> Result<u64, RpcError>;
}

fn json_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, RpcError> {
    value
        .get(field)
        .ok_or_else(|| RpcError::InvalidResponse(format!("No {} field", field)))?
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("{} was not string", field)))
}

/// Parses a `0x`-prefixed, **big-endian** hex string as a u64.
///
/// Note: the JSON-RPC encodes integers as big-endian. The deposit contract uses little-endian.
/// Therefore, this function is only useful for numbers encoded by the JSON RPC.
///
/// E.g., `0x01 == 1`
pub fn hex_to_u64_be(hex: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(strip_prefix(hex)?, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("Failed to parse hex as u64: {:?}", e)))
}

/// Parses a `0x`-prefixed, big-endian hex string as bytes.
///
/// E.g., `0x0102 == vec![1, 2]`
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, RpcError> {
    hex::decode(strip_prefix(hex)?)
        .map_err(|e| RpcError::InvalidResponse(format!("Failed to parse hex as bytes: {:?}", e)))
}

fn hex_to_hash(hex: &str) -> Result<Hash256, RpcError> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.len() == 32 {
        Ok(Hash256::from_slice(&bytes))
    } else {
        Err(RpcError::InvalidResponse(format!(
            "Hash was not 32 bytes: {:?}",
            bytes
        )))
    }
}

/// Removes the `0x` prefix from some bytes. Returns an error if the prefix is not present.
fn strip_prefix(hex: &str) -> Result<&str, RpcError> {
    hex.strip_prefix("0x")
        .ok_or_else(|| RpcError::InvalidResponse("Hex string did not start with `0x`".to_string()))
}
