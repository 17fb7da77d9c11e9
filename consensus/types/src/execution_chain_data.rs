use crate::{
    BeaconState, Deposit, DepositContainer, DepositTreeSnapshot, ExecutionData,
    LatestExecutionData, SparseTrieRecord,
};
use ssz_derive::{Decode, Encode};

/// Records whether the beacon chain has started and the data it started from.
#[derive(Debug, PartialEq, Clone, Default, Encode, Decode)]
pub struct ChainStartData {
    pub chain_started: bool,
    pub genesis_time: u64,
    /// Execution block number of the genesis seed. Zero until lazily resolved.
    pub genesis_block: u64,
    pub execution_data: ExecutionData,
    pub chainstart_deposits: Vec<Deposit>,
}

/// Everything the execution chain service needs to resume after a restart, written as a single
/// record.
///
/// Exactly one of `trie` or `deposit_snapshot` is expected to be present.
#[derive(Debug, PartialEq, Clone, Default, Encode, Decode)]
pub struct ExecutionChainData {
    pub current_execution_data: LatestExecutionData,
    pub chainstart_data: ChainStartData,
    pub beacon_state: Option<BeaconState>,
    pub deposit_containers: Vec<DepositContainer>,
    pub trie: Option<SparseTrieRecord>,
    pub deposit_snapshot: Option<DepositTreeSnapshot>,
}
