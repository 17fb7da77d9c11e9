//! Provides an in-memory execution node and metrics sink for testing the service without a
//! network.

use crate::deposit_log::encode_deposit_log_data;
use crate::metrics::MetricsSink;
use crate::rpc::{
    hex_to_u64_be, BatchElem, BlockHeader, ExecutionRpc, FilterQuery, Log, RpcError,
    DEPOSIT_EVENT_TOPIC, ETH_GET_BLOCK_BY_NUMBER,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use types::{Address, DepositData, Hash256, PublicKeyBytes, SignatureBytes, PUBLIC_KEY_BYTES_LEN};

/// The error code geth answers an oversized `eth_getLogs` with.
pub const TOO_MUCH_DATA_CODE: i64 = -32005;
pub const TOO_MUCH_DATA_MESSAGE: &str = "query returned more than 10000 results";

/// Returns the hash of mock block `number`. Never zero.
pub fn mock_block_hash(number: u64) -> Hash256 {
    let mut hash = Hash256::from_low_u64_be(number);
    hash.0[0] = 0xee;
    hash
}

/// Deposit data with a pubkey unique to `seed`.
pub fn deposit_data(seed: u64, amount: u64) -> DepositData {
    let mut pubkey = [0; PUBLIC_KEY_BYTES_LEN];
    pubkey[..8].copy_from_slice(&seed.to_le_bytes());
    pubkey[PUBLIC_KEY_BYTES_LEN - 1] = 0xaa;
    DepositData {
        pubkey: PublicKeyBytes::from_bytes(&pubkey).expect("pubkey has the correct length"),
        withdrawal_credentials: Hash256::from_low_u64_be(seed),
        amount,
        signature: SignatureBytes::empty(),
    }
}

/// A deposit contract log for `deposit_data` at `index`.
pub fn deposit_log(
    contract: Address,
    block_number: u64,
    log_index: u64,
    deposit_data: &DepositData,
    index: u64,
) -> Log {
    Log {
        address: contract,
        topics: vec![DEPOSIT_EVENT_TOPIC],
        data: encode_deposit_log_data(deposit_data, index),
        block_number,
        block_hash: mock_block_hash(block_number),
        log_index,
        removed: false,
    }
}

struct MockChain {
    headers: Vec<BlockHeader>,
    logs: Vec<Log>,
    next_deposit_index: u64,
    /// `eth_getLogs` spanning more than this many blocks is refused.
    max_log_block_range: Option<u64>,
    failing_requests: usize,
}

/// An execution chain held in memory, with a deposit contract at `deposit_contract`.
///
/// Block `n` has the timestamp given when it was mined, which defaults to `seconds_per_block`
/// after its parent.
pub struct MockExecutionNode {
    pub deposit_contract: Address,
    pub seconds_per_block: u64,
    chain: RwLock<MockChain>,
    filter_log_requests: Mutex<Vec<(u64, u64)>>,
    header_requests: AtomicUsize,
}

impl MockExecutionNode {
    /// A chain holding only block 0 at `genesis_timestamp`.
    pub fn new(genesis_timestamp: u64, seconds_per_block: u64, deposit_contract: Address) -> Self {
        let genesis = BlockHeader {
            number: 0,
            hash: mock_block_hash(0),
            parent_hash: Hash256::zero(),
            timestamp: genesis_timestamp,
        };
        Self {
            deposit_contract,
            seconds_per_block,
            chain: RwLock::new(MockChain {
                headers: vec![genesis],
                logs: vec![],
                next_deposit_index: 0,
                max_log_block_range: None,
                failing_requests: 0,
            }),
            filter_log_requests: Mutex::new(vec![]),
            header_requests: AtomicUsize::new(0),
        }
    }

    pub fn head(&self) -> BlockHeader {
        let chain = self.chain.read();
        chain.headers[chain.headers.len() - 1].clone()
    }

    pub fn header(&self, number: u64) -> Option<BlockHeader> {
        self.chain.read().headers.get(number as usize).cloned()
    }

    /// Mines a block `seconds_per_block` after the head, returning its number.
    pub fn mine_block(&self) -> u64 {
        let timestamp = self.head().timestamp + self.seconds_per_block;
        self.mine_block_at(timestamp)
    }

    pub fn mine_blocks(&self, count: u64) {
        for _ in 0..count {
            self.mine_block();
        }
    }

    /// Mines a block with the given timestamp, returning its number.
    pub fn mine_block_at(&self, timestamp: u64) -> u64 {
        let mut chain = self.chain.write();
        let parent = &chain.headers[chain.headers.len() - 1];
        let number = parent.number + 1;
        let header = BlockHeader {
            number,
            hash: mock_block_hash(number),
            parent_hash: parent.hash,
            timestamp,
        };
        chain.headers.push(header);
        number
    }

    /// Mines a block containing a deposit log for each of `deposits`, indexed after every
    /// deposit made so far. Returns the block number.
    pub fn mine_block_with_deposits(&self, deposits: &[DepositData]) -> u64 {
        let number = self.mine_block();
        let mut chain = self.chain.write();
        for (log_index, data) in deposits.iter().enumerate() {
            let index = chain.next_deposit_index;
            chain.next_deposit_index += 1;
            chain.logs.push(deposit_log(
                self.deposit_contract,
                number,
                log_index as u64,
                data,
                index,
            ));
        }
        number
    }

    /// Adds an arbitrary log. Does not advance the deposit index.
    pub fn add_raw_log(&self, log: Log) {
        self.chain.write().logs.push(log);
    }

    pub fn set_max_log_block_range(&self, range: Option<u64>) {
        self.chain.write().max_log_block_range = range;
    }

    /// The next `count` requests of any kind fail as if the node were unreachable.
    pub fn fail_next_requests(&self, count: usize) {
        self.chain.write().failing_requests = count;
    }

    /// Every `(from_block, to_block)` passed to `eth_getLogs`, successful or not.
    pub fn filter_log_requests(&self) -> Vec<(u64, u64)> {
        self.filter_log_requests.lock().clone()
    }

    /// Number of headers served, counting each element of a batch.
    pub fn header_requests(&self) -> usize {
        self.header_requests.load(Ordering::Relaxed)
    }

    fn check_failure(&self) -> Result<(), RpcError> {
        let mut chain = self.chain.write();
        if chain.failing_requests > 0 {
            chain.failing_requests -= 1;
            return Err(RpcError::Request("connection refused".into()));
        }
        Ok(())
    }

    fn serve_header(&self, number: Option<u64>) -> Result<BlockHeader, RpcError> {
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        match number {
            None => Ok(self.head()),
            Some(number) => self
                .header(number)
                .ok_or_else(|| RpcError::BlockNotFound(format!("block {}", number))),
        }
    }
}

#[async_trait]
impl ExecutionRpc for MockExecutionNode {
    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, RpcError> {
        self.filter_log_requests
            .lock()
            .push((query.from_block, query.to_block));
        self.check_failure()?;

        let chain = self.chain.read();
        if let Some(range) = chain.max_log_block_range {
            if query.to_block.saturating_sub(query.from_block) + 1 > range {
                return Err(RpcError::ServerMessage {
                    code: TOO_MUCH_DATA_CODE,
                    message: TOO_MUCH_DATA_MESSAGE.into(),
                });
            }
        }
        Ok(chain
            .logs
            .iter()
            .filter(|log| {
                (query.from_block..=query.to_block).contains(&log.block_number)
                    && (query.addresses.is_empty() || query.addresses.contains(&log.address))
            })
            .cloned()
            .collect())
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError> {
        self.check_failure()?;
        self.serve_header(number)
    }

    async fn header_by_hash(&self, hash: Hash256) -> Result<BlockHeader, RpcError> {
        self.check_failure()?;
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        self.chain
            .read()
            .headers
            .iter()
            .find(|header| header.hash == hash)
            .cloned()
            .ok_or_else(|| RpcError::BlockNotFound(format!("{:?}", hash)))
    }

    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), RpcError> {
        self.check_failure()?;
        for elem in batch.iter_mut() {
            if elem.method != ETH_GET_BLOCK_BY_NUMBER {
                elem.error = Some(RpcError::ServerMessage {
                    code: -32601,
                    message: format!("method {} not supported", elem.method),
                });
                continue;
            }
            let number = elem.params[0]
                .as_str()
                .ok_or_else(|| RpcError::InvalidResponse("block number param".into()))
                .and_then(hex_to_u64_be);
            match number.and_then(|number| self.serve_header(Some(number))) {
                Ok(header) => elem.result = Some(header.to_json()),
                Err(e) => elem.error = Some(e),
            }
        }
        Ok(())
    }

    async fn deposit_count(&self, address: Address, block: Option<u64>) -> Result<u64, RpcError> {
        self.check_failure()?;
        let block = block.unwrap_or_else(|| self.head().number);
        Ok(self
            .chain
            .read()
            .logs
            .iter()
            .filter(|log| {
                log.address == address
                    && log.block_number <= block
                    && log.topics.first() == Some(&DEPOSIT_EVENT_TOPIC)
            })
            .count() as u64)
    }
}

/// Records every metric update for later inspection.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    gauges: Mutex<HashMap<&'static str, i64>>,
}

impl RecordingMetrics {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<i64> {
        self.gauges.lock().get(name).copied()
    }
}

impl MetricsSink for RecordingMetrics {
    fn inc_counter(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauges.lock().insert(name, value);
    }
}
