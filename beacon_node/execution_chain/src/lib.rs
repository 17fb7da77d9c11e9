#[macro_use]
extern crate lazy_static;

mod block_reader;
mod chain_data;
mod deposit_cache;
mod deposit_log;
mod deposit_tree;
mod genesis;
mod header_cache;
pub mod http;
mod inner;
mod log_processing;
pub mod metrics;
pub mod rpc;
mod service;
pub mod test_utils;

pub use block_reader::SEARCH_THRESHOLD;
pub use chain_data::validate_deposit_containers;
pub use deposit_cache::{
    DepositCache, Error as DepositCacheError, FinalizedDeposits, InMemoryDepositCache,
};
pub use deposit_log::{encode_deposit_log_data, DepositLog};
pub use deposit_tree::{
    deposit_tree_from_record, migrate_legacy, new_deposit_tree, DepositAccumulator,
    DepositTreeKind, DepositTreeRecord, Error as DepositTreeError, SnapshotDepositTree,
    SparseDepositTrie,
};
pub use genesis::{is_valid_genesis_state, Error as GenesisError, PreGenesisState};
pub use header_cache::{HeaderCache, DEFAULT_HEADER_CACHE_SIZE};
pub use metrics::{MetricsSink, PrometheusMetrics};
pub use rpc::{BlockHeader, ExecutionRpc, FilterQuery, Log, RpcError};
pub use service::{
    endpoint_from_config, ChainStartedEvent, Config, Error, ErrorKind, FinalizationRequest,
    Service, ServiceDependencies, DEFAULT_EXECUTION_ENDPOINT,
};
