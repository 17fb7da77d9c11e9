//! Provides a very minimal set of functions for interfacing with an execution node via JSON-RPC
//! over HTTP.
//!
//! Only the calls the execution chain service needs are implemented: `eth_getLogs`,
//! `eth_getBlockByNumber`, `eth_getBlockByHash`, `eth_call` and batched requests.
//!
//! There is no ABI parsing here, all function signatures and topics are hard-coded as constants.

use crate::rpc::{
    hex_to_bytes, BatchElem, BlockHeader, ExecutionRpc, FilterQuery, Log, RpcError,
    DEPOSIT_COUNT_FN_SIGNATURE, DEPOSIT_COUNT_RESPONSE_BYTES, ETH_CALL, ETH_GET_BLOCK_BY_HASH,
    ETH_GET_BLOCK_BY_NUMBER, ETH_GET_LOGS,
};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, ClientBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use types::{Address, Hash256};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRequestBody<'a> {
    pub jsonrpc: &'a str,
    pub method: &'a str,
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonResponseBody {
    pub jsonrpc: String,
    #[serde(default)]
    pub error: Option<JsonError>,
    #[serde(default)]
    pub result: Value,
    pub id: Value,
}

impl JsonResponseBody {
    fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(RpcError::ServerMessage {
                code: error.code,
                message: error.message,
            }),
            (result, None) => Ok(result),
        }
    }
}

/// An execution node reached over HTTP.
pub struct HttpJsonRpc {
    client: Client,
    url: String,
    request_timeout: Duration,
    log_request_timeout: Duration,
}

impl HttpJsonRpc {
    pub fn new(
        url: String,
        request_timeout: Duration,
        log_request_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let client = ClientBuilder::new().build()?;
        Ok(Self {
            client,
            url,
            request_timeout,
            log_request_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn rpc_request<D: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<D, RpcError> {
        let body = JsonRequestBody {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id: json!(1),
        };

        let body: JsonResponseBody = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        serde_json::from_value(body.into_result()?).map_err(Into::into)
    }
}

#[async_trait]
impl ExecutionRpc for HttpJsonRpc {
    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, RpcError> {
        let logs: Vec<Value> = self
            .rpc_request(ETH_GET_LOGS, query.to_json(), self.log_request_timeout)
            .await?;
        logs.iter().map(Log::from_json).collect()
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError> {
        let tag = match number {
            Some(number) => format!("0x{:x}", number),
            None => "latest".to_string(),
        };
        let block: Value = self
            .rpc_request(
                ETH_GET_BLOCK_BY_NUMBER,
                json!([tag, false]),
                self.request_timeout,
            )
            .await?;
        BlockHeader::from_json(&block).map_err(|e| match e {
            RpcError::BlockNotFound(_) => RpcError::BlockNotFound(tag),
            e => e,
        })
    }

    async fn header_by_hash(&self, hash: Hash256) -> Result<BlockHeader, RpcError> {
        let block: Value = self
            .rpc_request(
                ETH_GET_BLOCK_BY_HASH,
                json!([format!("{:?}", hash), false]),
                self.request_timeout,
            )
            .await?;
        BlockHeader::from_json(&block).map_err(|e| match e {
            RpcError::BlockNotFound(_) => RpcError::BlockNotFound(format!("{:?}", hash)),
            e => e,
        })
    }

    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), RpcError> {
        if batch.is_empty() {
            return Ok(());
        }

        let bodies = batch
            .iter()
            .enumerate()
            .map(|(id, elem)| JsonRequestBody {
                jsonrpc: JSONRPC_VERSION,
                method: elem.method,
                params: elem.params.clone(),
                id: json!(id),
            })
            .collect::<Vec<_>>();

        let responses: Vec<JsonResponseBody> = self
            .client
            .post(&self.url)
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(&bodies)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // Responses to a batch may arrive in any order.
        for response in responses {
            let id = response
                .id
                .as_u64()
                .and_then(|id| usize::try_from(id).ok())
                .ok_or_else(|| RpcError::InvalidResponse("Batch response id".to_string()))?;
            let elem = batch.get_mut(id).ok_or_else(|| {
                RpcError::InvalidResponse(format!("Unknown batch response id {}", id))
            })?;
            match response.into_result() {
                Ok(result) => elem.result = Some(result),
                Err(e) => elem.error = Some(e),
            }
        }

        Ok(())
    }

    async fn deposit_count(&self, address: Address, block: Option<u64>) -> Result<u64, RpcError> {
        let tag = match block {
            Some(number) => format!("0x{:x}", number),
            None => "latest".to_string(),
        };
        let params = json!([
            {
                "to": format!("{:?}", address),
                "data": DEPOSIT_COUNT_FN_SIGNATURE,
            },
            tag
        ]);
        let response: String = self
            .rpc_request(ETH_CALL, params, self.request_timeout)
            .await?;
        parse_deposit_count_response(&response)
    }
}

/// The return value of `get_deposit_count()` is ABI-encoded `bytes` holding a little-endian u64.
pub fn parse_deposit_count_response(response: &str) -> Result<u64, RpcError> {
    let bytes = hex_to_bytes(response)?;
    if bytes.len() != DEPOSIT_COUNT_RESPONSE_BYTES {
        return Err(RpcError::InvalidResponse(format!(
            "Deposit count response was {} bytes, not {}",
            bytes.len(),
            DEPOSIT_COUNT_RESPONSE_BYTES
        )));
    }
    let mut count = [0; 8];
    count.copy_from_slice(&bytes[64..72]);
    Ok(u64::from_le_bytes(count))
}
