//! Types shared between the execution chain service and its storage.
//!
//! This is a narrow slice of the beacon chain types: only what deposit ingestion,
//! chain start detection and the persisted execution chain snapshot need.

pub mod beacon_state;
pub mod chain_spec;
pub mod checkpoint;
pub mod deposit_data;
pub mod deposit_tree_snapshot;
pub mod execution_chain_data;
pub mod execution_data;
pub mod pq_bytes;

pub use crate::beacon_state::{BeaconState, Validator, FAR_FUTURE_EPOCH, GENESIS_EPOCH};
pub use crate::chain_spec::{ChainSpec, DEPOSIT_CONTRACT_TREE_DEPTH};
pub use crate::checkpoint::Checkpoint;
pub use crate::deposit_data::{Deposit, DepositContainer, DepositData};
pub use crate::deposit_tree_snapshot::{
    DepositTreeSnapshot, FinalizedExecutionBlock, SparseTrieRecord,
};
pub use crate::execution_chain_data::{ChainStartData, ExecutionChainData};
pub use crate::execution_data::{ExecutionData, LatestExecutionData};
pub use crate::pq_bytes::{
    PublicKeyBytes, SignatureBytes, PUBLIC_KEY_BYTES_LEN, SIGNATURE_BYTES_LEN,
};

pub use ethereum_types::{Address, H256};

pub type Hash256 = H256;
pub type Slot = u64;
pub type Epoch = u64;
