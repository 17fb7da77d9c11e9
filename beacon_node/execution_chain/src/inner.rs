use crate::deposit_cache::DepositCache;
use crate::deposit_tree::{new_deposit_tree, DepositAccumulator};
use crate::genesis::PreGenesisState;
use crate::header_cache::HeaderCache;
use crate::metrics::MetricsSink;
use crate::rpc::ExecutionRpc;
use crate::service::{ChainStartedEvent, FinalizationRequest, ServiceDependencies};
use crate::Config;
use parking_lot::RwLock;
use std::sync::Arc;
use store::BeaconDb;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use types::{BeaconState, ChainSpec, ChainStartData, LatestExecutionData};

const CHAIN_START_CHANNEL_CAPACITY: usize = 16;

/// The deposit tree and everything that must change atomically with it.
pub struct DepositState {
    pub tree: Box<dyn DepositAccumulator>,
    /// Index of the last deposit applied, `-1` before the first.
    pub last_received_merkle_index: i64,
    pub chain_start_data: ChainStartData,
    pub pre_genesis_state: PreGenesisState,
}

impl DepositState {
    pub fn new(config: &Config) -> Self {
        Self {
            tree: new_deposit_tree(config.deposit_tree_kind),
            last_received_merkle_index: -1,
            chain_start_data: ChainStartData::default(),
            pre_genesis_state: PreGenesisState::new(),
        }
    }
}

/// Lock order: `processing`, then `latest`, then `deposits`. No guard is held across an await.
pub struct Inner {
    pub config: Config,
    pub spec: ChainSpec,
    pub rpc: Arc<dyn ExecutionRpc>,
    pub db: Arc<dyn BeaconDb>,
    pub deposit_cache: Arc<dyn DepositCache>,
    pub metrics: Arc<dyn MetricsSink>,
    pub header_cache: HeaderCache,
    pub latest: RwLock<LatestExecutionData>,
    pub deposits: RwLock<DepositState>,
    /// Held for reading while a log is applied.
    pub processing: RwLock<()>,
    pub to_finalize: RwLock<Option<FinalizationRequest>>,
    pub run_error: RwLock<Option<String>>,
    /// Updates that have failed in a row.
    pub update_failures: RwLock<u64>,
    pub finalized_state_at_startup: RwLock<Option<BeaconState>>,
    pub chain_start_tx: broadcast::Sender<ChainStartedEvent>,
    pub exit: CancellationToken,
}

impl Inner {
    pub fn new(config: Config, spec: ChainSpec, dependencies: ServiceDependencies) -> Self {
        let (chain_start_tx, _) = broadcast::channel(CHAIN_START_CHANNEL_CAPACITY);
        Self {
            header_cache: HeaderCache::new(config.header_cache_size),
            latest: RwLock::new(LatestExecutionData {
                last_requested_block: config.deposit_contract_deploy_block,
                ..LatestExecutionData::default()
            }),
            deposits: RwLock::new(DepositState::new(&config)),
            processing: RwLock::new(()),
            to_finalize: RwLock::new(None),
            run_error: RwLock::new(None),
            update_failures: RwLock::new(0),
            finalized_state_at_startup: RwLock::new(dependencies.finalized_state_at_startup),
            chain_start_tx,
            exit: CancellationToken::new(),
            rpc: dependencies.rpc,
            db: dependencies.db,
            deposit_cache: dependencies.deposit_cache,
            metrics: dependencies.metrics,
            config,
            spec,
        }
    }
}
