use crate::{
    deposit_cache::{DepositCache, Error as DepositCacheError},
    deposit_tree::{DepositTreeKind, Error as DepositTreeError},
    genesis,
    header_cache::Error as HeaderCacheError,
    http::HttpJsonRpc,
    inner::Inner,
    metrics::{self, MetricsSink},
    rpc::{BlockHeader, ExecutionRpc, RpcError},
};
use parking_lot::RwLockWriteGuard;
use serde::{Deserialize, Serialize};
use slog::{crit, debug, error, info, warn, Logger};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use store::BeaconDb;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant};
use types::{
    Address, BeaconState, ChainSpec, ChainStartData, DepositTreeSnapshot, Hash256,
    LatestExecutionData,
};

/// Indicates the default execution endpoint.
pub const DEFAULT_EXECUTION_ENDPOINT: &str = "http://localhost:8545";

const STANDARD_TIMEOUT_MILLIS: u64 = 15_000;
/// Timeout when doing an eth_getLogs to read the deposit contract logs.
const GET_DEPOSIT_LOG_TIMEOUT_MILLIS: u64 = 60_000;

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// A request to the execution node failed.
    Rpc(RpcError),
    HeaderCache(HeaderCacheError),
    /// A timestamp later than the latest known head was requested.
    TimeTooLate { requested: u64, latest: u64 },
    /// Every block down to block 0 is later than the requested timestamp.
    NoBlockBeforeTimestamp { time: u64 },
    /// The execution node did not return a header that was requested by number.
    HeaderNotFound { block_number: u64 },
    /// The log batch was halved down to nothing and the node still refused it.
    ZeroBatchSize { from_block: u64 },
    /// A log in the given block could not be parsed as a deposit.
    FailedToParseDepositLog { block_number: u64, error: String },
    /// A deposit log skipped an index.
    MissedDepositLog { expected: u64, received: u64 },
    /// The deposit tree and the log disagree on the next index.
    DepositIndexMismatch { num_of_items: u64, index: u64 },
    DepositTree(DepositTreeError),
    DepositCache(DepositCacheError),
    /// The persisted deposit tree is of a kind that cannot be loaded with the current config.
    WrongTreeKind { configured: DepositTreeKind },
    /// Migrating the legacy deposit trie produced a different root.
    MigrationRootMismatch { legacy: Hash256, migrated: Hash256 },
    /// The persisted deposit snapshot is corrupt.
    InvalidSnapshot(String),
    /// A finalized checkpoint exists but its state is unavailable.
    FinalizedStateMissing { root: Hash256 },
    /// The chain has not started, there is no endpoint to start it and no genesis state.
    NoGenesisState,
    Store(store::Error),
    /// The service was shut down.
    Cancelled,
}

/// Coarse classification of an `Error`, used to decide whether to retry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Expected to resolve by retrying later.
    Transient,
    /// The execution node or the persisted data broke an invariant.
    ProtocolViolation,
    Cancelled,
    /// The service cannot run.
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Rpc(_)
            | Error::HeaderCache(_)
            | Error::TimeTooLate { .. }
            | Error::NoBlockBeforeTimestamp { .. }
            | Error::HeaderNotFound { .. } => ErrorKind::Transient,
            Error::ZeroBatchSize { .. }
            | Error::FailedToParseDepositLog { .. }
            | Error::MissedDepositLog { .. }
            | Error::DepositIndexMismatch { .. }
            | Error::DepositTree(_)
            | Error::DepositCache(_)
            | Error::WrongTreeKind { .. }
            | Error::MigrationRootMismatch { .. } => ErrorKind::ProtocolViolation,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidSnapshot(_)
            | Error::FinalizedStateMissing { .. }
            | Error::NoGenesisState
            | Error::Store(_) => ErrorKind::Fatal,
        }
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Error::Rpc(e)
    }
}

impl From<HeaderCacheError> for Error {
    fn from(e: HeaderCacheError) -> Self {
        Error::HeaderCache(e)
    }
}

impl From<DepositTreeError> for Error {
    fn from(e: DepositTreeError) -> Self {
        match e {
            DepositTreeError::RootMismatch { legacy, migrated } => {
                Error::MigrationRootMismatch { legacy, migrated }
            }
            DepositTreeError::InvalidSnapshot(message) => Error::InvalidSnapshot(message),
            e => Error::DepositTree(e),
        }
    }
}

impl From<DepositCacheError> for Error {
    fn from(e: DepositCacheError) -> Self {
        Error::DepositCache(e)
    }
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Error::Store(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// An execution node running a HTTP JSON-RPC endpoint.
    pub endpoint: Option<String>,
    /// The address of the canonical deposit contract.
    pub deposit_contract_address: Address,
    /// Defines the first block that will be searched for deposit logs.
    ///
    /// Setting too high can result in missed logs. Setting too low will result in unnecessary
    /// calls to the execution node's HTTP JSON RPC.
    pub deposit_contract_deploy_block: u64,
    pub deposit_tree_kind: DepositTreeKind,
    /// The interval between polls of the execution head.
    pub head_poll_interval_millis: u64,
    /// The interval between "waiting for chain start" logs.
    pub chain_start_log_interval_millis: u64,
    /// The delay before retrying a failed initialization.
    pub retry_delay_millis: u64,
    pub request_timeout_millis: u64,
    pub log_request_timeout_millis: u64,
    pub header_cache_size: usize,
    /// The largest span of blocks requested from `eth_getLogs` at once.
    pub max_log_batch_size: u64,
    /// When fewer logs than this remain, the final batch is stretched to the follow height.
    pub deposit_log_request_limit: u64,
    /// Beyond this many blocks behind, fall back to batched historical log processing.
    pub max_tolerable_difference: u64,
    /// The execution chain data is persisted after every this-many deposits.
    pub execution_data_saving_interval: u64,
    /// Specifies the seconds after which a head is considered stale.
    pub node_far_behind_seconds: u64,
    /// Repeated initialization or update failures are only logged as errors every this-many
    /// attempts.
    pub error_log_threshold: u64,
    /// Substrings of node errors meaning a log query asked for too much data.
    pub too_much_data_patterns: Vec<String>,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    pub fn log_request_timeout(&self) -> Duration {
        Duration::from_millis(self.log_request_timeout_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Some(DEFAULT_EXECUTION_ENDPOINT.into()),
            deposit_contract_address: Address::zero(),
            deposit_contract_deploy_block: 1,
            deposit_tree_kind: DepositTreeKind::Snapshot,
            head_poll_interval_millis: 4_000,
            chain_start_log_interval_millis: 60_000,
            retry_delay_millis: 1_000,
            request_timeout_millis: STANDARD_TIMEOUT_MILLIS,
            log_request_timeout_millis: GET_DEPOSIT_LOG_TIMEOUT_MILLIS,
            header_cache_size: crate::header_cache::DEFAULT_HEADER_CACHE_SIZE,
            max_log_batch_size: 1_000,
            deposit_log_request_limit: 10_000,
            max_tolerable_difference: 50,
            execution_data_saving_interval: 1_000,
            node_far_behind_seconds: 300,
            error_log_threshold: 8,
            too_much_data_patterns: vec![
                "query returned more than 10000 results".into(),
                "request timed out".into(),
                "exceed maximum block range".into(),
                "Log response size exceeded".into(),
            ],
        }
    }
}

/// Builds the HTTP client for `config.endpoint`, if any.
pub fn endpoint_from_config(config: &Config) -> Result<Option<HttpJsonRpc>, String> {
    config
        .endpoint
        .clone()
        .map(|endpoint| {
            HttpJsonRpc::new(
                endpoint,
                config.request_timeout(),
                config.log_request_timeout(),
            )
            .map_err(|e| format!("Failed to create execution json rpc client: {:?}", e))
        })
        .transpose()
}

/// Sent to subscribers once the chain start conditions are met.
#[derive(Debug, PartialEq, Clone)]
pub struct ChainStartedEvent {
    pub genesis_time: u64,
    pub block_hash: Hash256,
    pub block_number: u64,
}

/// Deposits the beacon chain has finalized, as described by a finalized state.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct FinalizationRequest {
    /// The `execution_deposit_index` of the finalized state: one past the last finalized deposit.
    pub deposit_index: u64,
    pub block_hash: Hash256,
    pub block_number: u64,
}

/// Everything the service reads from or writes to, other than its configuration.
pub struct ServiceDependencies {
    pub rpc: Arc<dyn ExecutionRpc>,
    pub db: Arc<dyn BeaconDb>,
    pub deposit_cache: Arc<dyn DepositCache>,
    pub metrics: Arc<dyn MetricsSink>,
    /// The finalized state, if the node already had one when it started.
    pub finalized_state_at_startup: Option<BeaconState>,
}

/// Follows the execution chain: tracks its head, ingests deposit contract logs into the deposit
/// tree and deposit cache, detects chain start and persists everything needed to resume.
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<Inner>,
    pub log: Logger,
}

impl Service {
    /// Creates a new service from the persisted execution chain data, if any. Does not contact
    /// the execution node.
    pub fn new(
        config: Config,
        spec: ChainSpec,
        dependencies: ServiceDependencies,
        log: Logger,
    ) -> Result<Self, Error> {
        let service = Self {
            inner: Arc::new(Inner::new(config, spec, dependencies)),
            log,
        };

        service.ensure_valid_chain_data()?;
        if let Some(data) = service.inner.db.execution_chain_data()? {
            service.initialize_from_chain_data(data)?;
        }

        Ok(service)
    }

    /// Spawns the service loop onto the current tokio runtime.
    ///
    /// Fails immediately if the chain can never start: it has not started, there is no endpoint
    /// to follow and no genesis state to fall back on.
    pub fn start(&self) -> Result<JoinHandle<()>, Error> {
        if !self.is_chain_started()
            && self.inner.config.endpoint.is_none()
            && self.inner.db.genesis_state()?.is_none()
        {
            crit!(
                self.log,
                "No execution endpoint and no genesis state";
                "info" => "provide an execution endpoint or a genesis state"
            );
            return Err(Error::NoGenesisState);
        }

        let service = self.clone();
        Ok(tokio::spawn(async move { service.run().await }))
    }

    /// Stops the service loop and any in-flight search.
    pub fn shutdown(&self) {
        self.inner.exit.cancel();
    }

    async fn run(self) {
        *self.inner.run_error.write() = None;
        if self.init_service().await.is_err() {
            debug!(self.log, "Execution chain service exiting before initialization");
            return;
        }
        // The startup state is not needed once initialized.
        self.inner.finalized_state_at_startup.write().take();

        let head_interval = Duration::from_millis(self.inner.config.head_poll_interval_millis);
        let chain_start_interval =
            Duration::from_millis(self.inner.config.chain_start_log_interval_millis);
        let mut head_ticker = interval_at(Instant::now() + head_interval, head_interval);
        let mut chain_start_ticker =
            interval_at(Instant::now() + chain_start_interval, chain_start_interval);

        loop {
            tokio::select! {
                _ = self.inner.exit.cancelled() => {
                    *self.inner.run_error.write() = None;
                    debug!(self.log, "Execution chain service shutting down");
                    return;
                }
                _ = head_ticker.tick() => {
                    // Failures are logged and recorded in `status` by `update`.
                    let _ = self.update().await;
                }
                _ = chain_start_ticker.tick() => {
                    if !self.is_chain_started() {
                        self.log_till_chain_start().await;
                    }
                }
            }
        }
    }

    /// Connects to the execution node and catches up on historical deposit logs, retrying until
    /// it succeeds, the service is shut down or a fatal error occurs.
    pub async fn init_service(&self) -> Result<(), Error> {
        let mut failures = 0;
        loop {
            self.check_cancelled()?;
            match self.try_init_service().await {
                Ok(()) => {
                    self.inner.metrics.set_gauge(metrics::ENDPOINT_CONNECTED, 1);
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.kind() == ErrorKind::Fatal => {
                    self.inner.metrics.set_gauge(metrics::ENDPOINT_CONNECTED, 0);
                    *self.inner.run_error.write() = Some(format!("{:?}", e));
                    crit!(
                        self.log,
                        "Execution chain service cannot start";
                        "error" => ?e,
                    );
                    return Err(e);
                }
                Err(e) => {
                    self.inner.metrics.set_gauge(metrics::ENDPOINT_CONNECTED, 0);
                    *self.inner.run_error.write() = Some(format!("{:?}", e));
                    failures += 1;
                    if failures >= self.inner.config.error_log_threshold {
                        error!(
                            self.log,
                            "Unable to initialize execution chain service";
                            "error" => ?e,
                            "info" => "perhaps the execution node is not fully synced"
                        );
                        failures = 0;
                    }
                    tokio::select! {
                        _ = self.inner.exit.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(Duration::from_millis(self.inner.config.retry_delay_millis)) => {}
                    }
                }
            }
        }
    }

    async fn try_init_service(&self) -> Result<(), Error> {
        let head = self.inner.rpc.header_by_number(None).await?;
        self.process_block_header(&head)?;

        let follow_block = self.followed_block_height().await?;
        self.process_past_logs(follow_block).await?;

        match self.cache_headers_for_voting(follow_block).await {
            Err(Error::TimeTooLate { .. }) => {
                debug!(self.log, "Unable to cache headers for execution votes");
            }
            other => other?,
        }

        self.resolve_genesis_block().await?;
        *self.inner.run_error.write() = None;
        Ok(())
    }

    /// A genesis state supplied without chain start data does not name its execution block
    /// height. Look it up from the block hash, assuming block 0 if the hash is unknown.
    async fn resolve_genesis_block(&self) -> Result<(), Error> {
        let (started, genesis_block, genesis_hash) = {
            let deposits = self.inner.deposits.read();
            let chain_start = &deposits.chain_start_data;
            (
                chain_start.chain_started,
                chain_start.genesis_block,
                chain_start.execution_data.block_hash,
            )
        };
        if !started || genesis_block != 0 {
            return Ok(());
        }

        let genesis_block = if genesis_hash.is_zero() {
            0
        } else {
            self.header_by_hash(genesis_hash).await?.number
        };
        self.inner.deposits.write().chain_start_data.genesis_block = genesis_block;
        self.save_execution_chain_data()
    }

    /// One tick of the service loop: poll the head, follow it and apply pending finalization.
    pub async fn update(&self) -> Result<(), Error> {
        let result = self.follow_head().await;
        match &result {
            Ok(()) => {
                *self.inner.run_error.write() = None;
                *self.inner.update_failures.write() = 0;
            }
            Err(e) => self.record_update_failure(e),
        }

        self.process_finalization_request();
        result
    }

    async fn follow_head(&self) -> Result<(), Error> {
        let head = match self.inner.rpc.header_by_number(None).await {
            Ok(head) => head,
            Err(e) => {
                self.inner.metrics.set_gauge(metrics::ENDPOINT_CONNECTED, 0);
                return Err(e.into());
            }
        };
        self.inner.metrics.set_gauge(metrics::ENDPOINT_CONNECTED, 1);
        self.process_block_header(&head)?;
        self.handle_follow_distance().await
    }

    /// Failed updates are retried on the next tick. Only every `error_log_threshold`th failure in
    /// a row is logged as an error.
    fn record_update_failure(&self, e: &Error) {
        if e.kind() == ErrorKind::Cancelled {
            return;
        }
        *self.inner.run_error.write() = Some(format!("{:?}", e));
        let failures = {
            let mut failures = self.inner.update_failures.write();
            *failures += 1;
            *failures
        };
        if failures % self.inner.config.error_log_threshold.max(1) == 0 {
            error!(
                self.log,
                "Failed to follow execution chain";
                "error" => ?e,
                "consecutive_failures" => failures,
            );
        } else {
            debug!(
                self.log,
                "Failed to follow execution chain";
                "error" => ?e,
                "consecutive_failures" => failures,
            );
        }
    }

    /// Records `header` as the latest execution head.
    pub fn process_block_header(&self, header: &BlockHeader) -> Result<(), Error> {
        {
            let mut latest = self.inner.latest.write();
            latest.block_height = header.number;
            latest.block_hash = header.hash;
            latest.block_time = header.timestamp;
        }
        self.inner.header_cache.add_header(header.clone())?;

        let sink = &self.inner.metrics;
        sink.set_gauge(metrics::LATEST_BLOCK_HEIGHT, header.number as i64);
        sink.set_gauge(metrics::LATEST_BLOCK_TIME, header.timestamp as i64);
        debug!(
            self.log,
            "Latest execution chain event";
            "block_number" => header.number,
            "block_hash" => ?header.hash,
            "timestamp" => header.timestamp,
        );
        Ok(())
    }

    async fn handle_follow_distance(&self) -> Result<(), Error> {
        let latest = self.latest_execution_data();
        let now = unix_now();
        if latest
            .block_time
            .saturating_add(self.inner.config.node_far_behind_seconds)
            < now
        {
            warn!(
                self.log,
                "Execution endpoint is not synced";
                "latest_block_time" => latest.block_time,
                "now" => now,
            );
        }

        if !self.is_chain_started() {
            self.process_chain_start_from_block_number(latest.last_requested_block)
                .await?;
        }

        // If the last requested block has not changed there are no new logs to process, and the
        // follow distance is not being respected.
        if latest.last_requested_block == latest.block_height {
            error!(
                self.log,
                "Beacon node is not respecting the follow distance";
                "info" => "the execution node may be syncing",
                "block_height" => latest.block_height,
            );
            return Ok(());
        }

        self.request_batched_headers_and_logs().await
    }

    /// Logs progress towards the chain start conditions.
    pub async fn log_till_chain_start(&self) {
        if self.is_chain_started() {
            return;
        }
        let last_requested_block = self.latest_execution_data().last_requested_block;
        let header = match self.retrieve_header_info(last_requested_block).await {
            Ok(header) => header,
            Err(e) => {
                error!(self.log, "Unable to retrieve block for chain start log"; "error" => ?e);
                return;
            }
        };

        let spec = &self.inner.spec;
        let (validator_count, genesis_time) = self.current_count_and_time(header.timestamp);
        let validators_needed =
            spec.min_genesis_active_validator_count.saturating_sub(validator_count as u64);
        let seconds_left = spec.min_genesis_time.saturating_sub(genesis_time);
        info!(
            self.log,
            "Currently waiting for chain start";
            "additional_validators_needed" => validators_needed,
            "genesis_in_seconds" => seconds_left,
        );
    }

    /// Returns the number of active pre-genesis validators and the genesis time a start at
    /// `block_time` would give. Both are zero if there are no validators.
    pub(crate) fn current_count_and_time(&self, block_time: u64) -> (usize, u64) {
        let deposits = self.inner.deposits.read();
        if deposits.pre_genesis_state.num_validators() == 0 {
            return (0, 0);
        }
        (
            deposits.pre_genesis_state.active_validator_count(),
            genesis::genesis_time(block_time, &self.inner.spec),
        )
    }

    /// Queue deposits for finalization on the next update.
    pub fn set_to_finalize(&self, request: Option<FinalizationRequest>) {
        *(self.inner.to_finalize.write()) = request;
    }

    fn process_finalization_request(&self) {
        let request = self.inner.to_finalize.write().take();
        if let Some(request) = request {
            match self.finalize_deposits(request) {
                Ok(true) => info!(
                    self.log,
                    "Successfully finalized deposit tree";
                    "finalized_deposit_count" => request.deposit_index,
                ),
                Ok(false) => debug!(
                    self.log,
                    "Deposit tree already finalized";
                    "deposit_count_to_finalize" => request.deposit_index,
                ),
                Err(e) => warn!(
                    self.log,
                    "Failed to finalize deposit cache";
                    "error" => ?e,
                    "info" => "this should resolve on its own"
                ),
            }
        }
    }

    /// Finalizes the deposit tree and deposit cache up to `request.deposit_index - 1` and prunes
    /// what is no longer needed. Returns `false` if there was nothing new to finalize.
    pub fn finalize_deposits(&self, request: FinalizationRequest) -> Result<bool, Error> {
        let Some(last_index) = request.deposit_index.checked_sub(1) else {
            return Ok(false);
        };
        if self
            .inner
            .deposit_cache
            .finalized_deposits()
            .map_or(false, |finalized| finalized.merkle_trie_index >= last_index)
        {
            return Ok(false);
        }

        self.inner.deposits.write().tree.finalize(
            last_index,
            request.block_hash,
            request.block_number,
        )?;
        let cache = &self.inner.deposit_cache;
        cache.insert_finalized_deposits(last_index, request.block_hash, request.block_number)?;
        cache.prune_proofs(last_index);
        cache.prune_pending_deposits(request.deposit_index);
        Ok(true)
    }

    /// Holds off log processing for as long as the guard is alive.
    pub fn exclusive_processing(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.processing.write()
    }

    /// Returns `Err` with a description of the last failure if the service is unhealthy.
    pub fn status(&self) -> Result<(), String> {
        match self.inner.run_error.read().as_ref() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn subscribe_chain_start(&self) -> broadcast::Receiver<ChainStartedEvent> {
        self.inner.chain_start_tx.subscribe()
    }

    pub fn latest_execution_data(&self) -> LatestExecutionData {
        self.inner.latest.read().clone()
    }

    pub fn chain_start_data(&self) -> ChainStartData {
        self.inner.deposits.read().chain_start_data.clone()
    }

    pub fn is_chain_started(&self) -> bool {
        self.inner.deposits.read().chain_start_data.chain_started
    }

    /// Index of the last deposit log applied, or `-1` before any.
    pub fn last_received_merkle_index(&self) -> i64 {
        self.inner.deposits.read().last_received_merkle_index
    }

    pub fn deposit_root(&self) -> Hash256 {
        self.inner.deposits.read().tree.hash_tree_root()
    }

    pub fn deposit_count(&self) -> u64 {
        self.inner.deposits.read().tree.num_of_items()
    }

    pub fn deposit_tree_kind(&self) -> DepositTreeKind {
        self.inner.deposits.read().tree.kind()
    }

    /// A proof of the deposit at `index` against the current `deposit_root()`.
    pub fn deposit_proof(&self, index: u64) -> Result<Vec<Hash256>, Error> {
        self.inner
            .deposits
            .read()
            .tree
            .merkle_proof(index)
            .map_err(Into::into)
    }

    /// The EIP-4881 snapshot of the finalized deposit tree, if the snapshot backend is in use.
    pub fn deposit_snapshot(&self) -> Option<DepositTreeSnapshot> {
        match self.inner.deposits.read().tree.to_record() {
            crate::deposit_tree::DepositTreeRecord::Snapshot(snapshot) => Some(snapshot),
            crate::deposit_tree::DepositTreeRecord::SparseTrie(_) => None,
        }
    }

    pub fn pre_genesis_state(&self) -> BeaconState {
        self.inner.deposits.read().pre_genesis_state.state().clone()
    }

    pub fn deposit_cache(&self) -> &Arc<dyn DepositCache> {
        &self.inner.deposit_cache
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), Error> {
        if self.inner.exit.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
