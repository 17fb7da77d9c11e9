#![cfg(test)]
use execution_chain::test_utils::{
    deposit_data, deposit_log, mock_block_hash, MockExecutionNode, RecordingMetrics,
};
use execution_chain::{
    metrics, rpc::DEPOSIT_EVENT_TOPIC, ChainStartedEvent, Config, DepositAccumulator,
    DepositTreeKind, Error, ErrorKind, FinalizationRequest, InMemoryDepositCache, Log, Service,
    ServiceDependencies, SparseDepositTrie,
};
use logging::test_logger;
use merkle_proof::verify_merkle_proof;
use slog::{o, Drain, Logger, Never, OwnedKVList, Record};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::{BeaconDb, BeaconStore, MemoryStore};
use tree_hash::TreeHash;
use types::{
    Address, BeaconState, ChainSpec, Checkpoint, DepositTreeSnapshot, ExecutionChainData,
    ExecutionData, Hash256, SparseTrieRecord, DEPOSIT_CONTRACT_TREE_DEPTH,
};

const GENESIS_TIMESTAMP: u64 = 1_600_000_000;
const MAX_DEPOSIT: u64 = 32_000_000_000;

fn deposit_contract() -> Address {
    Address::repeat_byte(0x42)
}

struct Harness {
    node: Arc<MockExecutionNode>,
    db: Arc<BeaconStore<MemoryStore>>,
    metrics: Arc<RecordingMetrics>,
    spec: ChainSpec,
}

impl Harness {
    fn new() -> Self {
        let spec = ChainSpec::minimal();
        Self {
            node: Arc::new(MockExecutionNode::new(
                GENESIS_TIMESTAMP,
                spec.seconds_per_execution_block,
                deposit_contract(),
            )),
            db: Arc::new(BeaconStore::open_ephemeral()),
            metrics: Arc::new(RecordingMetrics::default()),
            spec,
        }
    }

    fn config(&self) -> Config {
        Config {
            endpoint: None,
            deposit_contract_address: deposit_contract(),
            deposit_contract_deploy_block: 0,
            retry_delay_millis: 10,
            max_log_batch_size: 100,
            ..Config::default()
        }
    }

    fn service_with(
        &self,
        config: Config,
        finalized_state_at_startup: Option<BeaconState>,
    ) -> Result<Service, Error> {
        self.build_service(config, self.db.clone(), finalized_state_at_startup, test_logger())
    }

    fn build_service(
        &self,
        config: Config,
        db: Arc<dyn BeaconDb>,
        finalized_state_at_startup: Option<BeaconState>,
        log: Logger,
    ) -> Result<Service, Error> {
        Service::new(
            config,
            self.spec.clone(),
            ServiceDependencies {
                rpc: self.node.clone(),
                db,
                deposit_cache: Arc::new(InMemoryDepositCache::new()),
                metrics: self.metrics.clone(),
                finalized_state_at_startup,
            },
            log,
        )
    }

    fn service(&self) -> Service {
        self.service_with(self.config(), None)
            .expect("should build service")
    }

    /// Mines a block holding one deposit per seed, then `blocks_after` empty blocks.
    fn mine_deposits(&self, seeds: std::ops::Range<u64>, blocks_after: u64) -> u64 {
        let deposits = seeds
            .map(|seed| deposit_data(seed, MAX_DEPOSIT))
            .collect::<Vec<_>>();
        let block = self.node.mine_block_with_deposits(&deposits);
        self.node.mine_blocks(blocks_after);
        block
    }
}

/// Counts the error records logged through it.
#[derive(Clone, Default)]
struct ErrorCounter {
    errors: Arc<AtomicUsize>,
}

impl ErrorCounter {
    fn logger(&self) -> Logger {
        Logger::root(self.clone(), o!())
    }

    fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

impl Drain for ErrorCounter {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, _: &OwnedKVList) -> Result<(), Never> {
        if record.level() == slog::Level::Error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Serves reads from memory but refuses to persist execution chain data.
struct ReadOnlyDb(BeaconStore<MemoryStore>);

impl BeaconDb for ReadOnlyDb {
    fn save_execution_chain_data(&self, _: &ExecutionChainData) -> Result<(), store::Error> {
        Err(store::Error::DBError {
            message: "database is read only".into(),
        })
    }

    fn execution_chain_data(&self) -> Result<Option<ExecutionChainData>, store::Error> {
        self.0.execution_chain_data()
    }

    fn genesis_state(&self) -> Result<Option<BeaconState>, store::Error> {
        self.0.genesis_state()
    }

    fn finalized_checkpoint(&self) -> Result<Option<Checkpoint>, store::Error> {
        self.0.finalized_checkpoint()
    }

    fn state_by_root(&self, root: &Hash256) -> Result<Option<BeaconState>, store::Error> {
        self.0.state_by_root(root)
    }
}

mod ingestion {
    use super::*;

    #[tokio::test]
    async fn imports_deposits_up_to_follow_distance() {
        let harness = Harness::new();
        harness.mine_deposits(0..3, 40);
        let service = harness.service();

        service.init_service().await.expect("should initialize");

        // Head 41 at +82s, follow distance 16 blocks of 2s: the followed block is 25.
        let latest = service.latest_execution_data();
        assert_eq!(latest.block_height, 41);
        assert_eq!(latest.last_requested_block, 25);
        assert_eq!(service.deposit_count(), 3);
        assert_eq!(service.last_received_merkle_index(), 2);
        assert_eq!(service.deposit_cache().len(), 3);
        assert!(!service.is_chain_started());
        assert_eq!(service.pre_genesis_state().validators.len(), 3);
        assert_eq!(harness.metrics.counter(metrics::VALID_DEPOSIT_LOGS), 3);
        assert_eq!(harness.metrics.gauge(metrics::DEPOSIT_COUNT), Some(3));
        assert_eq!(
            harness.metrics.gauge(metrics::LAST_REQUESTED_BLOCK),
            Some(25)
        );
    }

    #[tokio::test]
    async fn restores_from_saved_chain_data() {
        let harness = Harness::new();
        harness.mine_deposits(0..3, 40);
        let service = harness.service();
        service.init_service().await.expect("should initialize");
        service
            .save_execution_chain_data()
            .expect("should save chain data");

        let restored = harness.service();
        assert_eq!(restored.deposit_count(), 3);
        assert_eq!(restored.deposit_root(), service.deposit_root());
        assert_eq!(restored.last_received_merkle_index(), 2);
        assert_eq!(
            restored.latest_execution_data(),
            service.latest_execution_data()
        );
        assert_eq!(restored.deposit_cache().len(), 3);
        assert_eq!(
            restored.pre_genesis_state(),
            service.pre_genesis_state()
        );
    }

    #[tokio::test]
    async fn follows_head_block_by_block() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 40);
        let service = harness.service();
        service.init_service().await.expect("should initialize");

        harness.mine_deposits(1..3, 20);
        service.update().await.expect("should update");

        // Head 62 at +124s: the followed block is 46, reached one block at a time.
        assert_eq!(service.latest_execution_data().last_requested_block, 46);
        assert_eq!(service.deposit_count(), 3);
        let requests = harness.node.filter_log_requests();
        assert!(requests.ends_with(&[(45, 45), (46, 46)]));
        assert!(service.status().is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_batches_when_far_behind() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 40);
        let service = harness.service();
        service.init_service().await.expect("should initialize");

        harness.mine_deposits(1..2, 199);
        service.update().await.expect("should update");

        // Head 241 at +482s: the followed block is 225, far beyond the tolerable difference.
        assert_eq!(service.latest_execution_data().last_requested_block, 225);
        assert_eq!(service.deposit_count(), 2);
        let requests = harness.node.filter_log_requests();
        assert!(requests
            .iter()
            .any(|(from, to)| *from == 25 && *to > *from));
    }

    #[tokio::test]
    async fn halves_batch_when_node_refuses_range() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 60);
        harness.mine_deposits(1..2, 150);
        harness.node.set_max_log_block_range(Some(10));
        let service = harness.service();

        service.process_past_logs(184).await.expect("should sync");

        assert_eq!(service.deposit_count(), 2);
        assert_eq!(service.latest_execution_data().last_requested_block, 184);
        let requests = harness.node.filter_log_requests();
        // The whole remaining range is tried first, then the batch is halved.
        assert_eq!(requests[0], (0, 184));
        assert_eq!(requests[1], (0, 50));
        assert_eq!(requests[2], (0, 25));
        assert_eq!(requests[3], (0, 12));
        assert_eq!(requests[4], (0, 6));
        let batch_size = harness
            .metrics
            .gauge(metrics::LOG_BATCH_SIZE)
            .expect("batch size is reported");
        assert!(batch_size > 0 && batch_size <= 100);
    }

    #[tokio::test]
    async fn zero_batch_size_is_an_error() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 60);
        harness.node.set_max_log_block_range(Some(0));
        let service = harness.service();

        let error = service.process_past_logs(50).await.unwrap_err();
        assert_eq!(error, Error::ZeroBatchSize { from_block: 0 });
        assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(service.deposit_count(), 0);
    }

    #[tokio::test]
    async fn retries_initialization() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 40);
        harness.node.fail_next_requests(3);
        let service = harness.service();

        service.init_service().await.expect("should initialize");
        assert_eq!(service.deposit_count(), 1);
        assert!(service.status().is_ok());
        assert_eq!(harness.metrics.gauge(metrics::ENDPOINT_CONNECTED), Some(1));
    }

    #[tokio::test]
    async fn shutdown_cancels_initialization() {
        let harness = Harness::new();
        harness.node.fail_next_requests(usize::MAX);
        let service = harness.service();
        service.shutdown();

        assert_eq!(service.init_service().await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn batch_grows_back_after_refusals() {
        let harness = Harness::new();
        harness.node.mine_blocks(300);
        // Spans of up to 31 blocks are served.
        harness.node.set_max_log_block_range(Some(31));
        let config = Config {
            // Never stretch the final batch.
            deposit_log_request_limit: 0,
            ..harness.config()
        };
        let service = harness.service_with(config, None).expect("should build service");

        service.process_past_logs(300).await.expect("should sync");
        assert_eq!(service.latest_execution_data().last_requested_block, 300);

        let requests = harness.node.filter_log_requests();
        assert_eq!(
            &requests[..9],
            &[
                (0, 100),
                (0, 50),
                (0, 25),
                (25, 60),
                (25, 42),
                (42, 69),
                (69, 106),
                (69, 87),
                (87, 115),
            ]
        );

        let served = |(from, to): (u64, u64)| to - from + 1 <= 31;
        for pair in requests.windows(2) {
            let (current, next) = (pair[0], pair[1]);
            let batch_size = current.1 - current.0;
            assert!(batch_size <= 100, "{:?}", current);
            if next.1 == 300 {
                // Clamped to the follow block.
                continue;
            }
            let next_batch_size = next.1 - next.0;
            if served(current) {
                assert_eq!(next.0, current.1);
                assert_eq!(next_batch_size, (batch_size + 10).min(100));
            } else {
                assert_eq!(next.0, current.0);
                assert_eq!(next_batch_size, batch_size / 2);
            }
        }
    }

    #[tokio::test]
    async fn fatal_error_stops_initialization() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 40);
        let db = Arc::new(ReadOnlyDb(BeaconStore::open_ephemeral()));
        let service = harness
            .build_service(harness.config(), db, None, test_logger())
            .expect("should build service");

        // Deposit 0 is persisted as soon as it is applied, which the database refuses.
        let result = tokio::time::timeout(Duration::from_secs(10), service.init_service())
            .await
            .expect("fatal errors are not retried");
        let error = result.unwrap_err();
        assert!(matches!(error, Error::Store(_)), "{:?}", error);
        assert_eq!(error.kind(), ErrorKind::Fatal);
        assert_eq!(harness.node.filter_log_requests().len(), 1);
        assert!(service.status().is_err());
        assert_eq!(harness.metrics.gauge(metrics::ENDPOINT_CONNECTED), Some(0));
    }

    #[tokio::test]
    async fn repeated_update_failures_are_logged_sparingly() {
        let harness = Harness::new();
        harness.mine_deposits(0..1, 40);
        let counter = ErrorCounter::default();
        let config = Config {
            error_log_threshold: 3,
            ..harness.config()
        };
        let service = harness
            .build_service(config, harness.db.clone(), None, counter.logger())
            .expect("should build service");
        service.init_service().await.expect("should initialize");
        assert_eq!(counter.errors(), 0);

        harness.node.fail_next_requests(6);
        for _ in 0..6 {
            assert!(matches!(service.update().await, Err(Error::Rpc(_))));
        }
        assert_eq!(counter.errors(), 2);
        assert!(service.status().is_err());

        // A success resets the count.
        service.update().await.expect("should update");
        assert!(service.status().is_ok());
        harness.node.fail_next_requests(2);
        for _ in 0..2 {
            assert!(service.update().await.is_err());
        }
        assert_eq!(counter.errors(), 2);
    }
}

mod deposit_logs {
    use super::*;

    fn log(block_number: u64, index: u64) -> Log {
        deposit_log(
            deposit_contract(),
            block_number,
            0,
            &deposit_data(index, MAX_DEPOSIT),
            index,
        )
    }

    #[tokio::test]
    async fn rejects_gap_and_rolls_back() {
        let harness = Harness::new();
        harness.node.mine_blocks(40);
        harness.node.add_raw_log(log(1, 0));
        harness.node.add_raw_log(log(2, 2));
        let service = harness.service();

        let error = service.process_past_logs(25).await.unwrap_err();
        assert_eq!(
            error,
            Error::MissedDepositLog {
                expected: 1,
                received: 2
            }
        );
        assert_eq!(service.deposit_count(), 1);
        assert_eq!(service.latest_execution_data().last_requested_block, 0);
        assert_eq!(harness.metrics.counter(metrics::MISSED_DEPOSIT_LOGS), 1);
    }

    #[test]
    fn replayed_log_is_ignored() {
        let harness = Harness::new();
        let service = harness.service();

        service.process_log(&log(1, 0)).expect("should apply log");
        let root = service.deposit_root();
        service.process_log(&log(1, 0)).expect("should ignore replay");

        assert_eq!(service.deposit_count(), 1);
        assert_eq!(service.deposit_root(), root);
        assert_eq!(service.deposit_cache().len(), 1);
        assert_eq!(harness.metrics.counter(metrics::VALID_DEPOSIT_LOGS), 1);
    }

    #[test]
    fn saves_every_interval_deposits() {
        let harness = Harness::new();
        let config = Config {
            execution_data_saving_interval: 2,
            ..harness.config()
        };
        let service = harness.service_with(config, None).expect("should build service");

        let persisted_deposits = || {
            harness
                .db
                .execution_chain_data()
                .unwrap()
                .map(|data| data.deposit_containers.len())
        };
        assert_eq!(persisted_deposits(), None);

        let mut persisted = vec![];
        for index in 0..5 {
            service
                .process_log(&log(index + 1, index))
                .expect("should apply log");
            persisted.push(persisted_deposits());
        }
        assert_eq!(
            persisted,
            vec![Some(1), Some(1), Some(3), Some(3), Some(5)]
        );

        // A replay does not save.
        harness
            .db
            .save_execution_chain_data(&ExecutionChainData::default())
            .expect("should save chain data");
        service.process_log(&log(5, 4)).expect("should ignore replay");
        assert_eq!(persisted_deposits(), Some(0));
    }

    #[test]
    fn exclusive_processing_holds_off_logs() {
        let harness = Harness::new();
        let service = harness.service();

        let guard = service.exclusive_processing();
        let (applied_tx, applied_rx) = std::sync::mpsc::channel();
        let worker = {
            let service = service.clone();
            std::thread::spawn(move || {
                let result = service.process_log(&log(1, 0));
                let _ = applied_tx.send(());
                result
            })
        };

        assert!(applied_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(service.deposit_count(), 0);

        drop(guard);
        applied_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("log is applied once the guard is released");
        worker
            .join()
            .expect("worker should not panic")
            .expect("should apply log");
        assert_eq!(service.deposit_count(), 1);
    }

    #[test]
    fn ignores_other_events() {
        let harness = Harness::new();
        let service = harness.service();

        let mut other = log(1, 0);
        other.topics = vec![Hash256::repeat_byte(7)];
        service.process_log(&other).expect("should skip log");

        let mut removed = log(1, 0);
        removed.removed = true;
        service.process_log(&removed).expect("should skip log");

        assert_eq!(service.deposit_count(), 0);
    }

    #[test]
    fn malformed_log_is_an_error() {
        let harness = Harness::new();
        let service = harness.service();

        let truncated = Log {
            data: vec![0; 64],
            ..log(3, 0)
        };
        assert_eq!(truncated.topics[0], DEPOSIT_EVENT_TOPIC);
        match service.process_log(&truncated) {
            Err(Error::FailedToParseDepositLog { block_number, .. }) => {
                assert_eq!(block_number, 3)
            }
            other => panic!("expected parse failure, got {:?}", other),
        }
    }
}

mod block_search {
    use super::*;

    /// Timestamps with uneven gaps, strictly increasing.
    fn uneven_chain(harness: &Harness) {
        for i in 1..=120u64 {
            harness
                .node
                .mine_block_at(GENESIS_TIMESTAMP + 2 * i + (i / 10) * 5);
        }
    }

    fn expected_block(harness: &Harness, time: u64) -> u64 {
        (0..=120u64)
            .rev()
            .find(|n| {
                harness
                    .node
                    .header(*n)
                    .map_or(false, |header| header.timestamp <= time)
            })
            .expect("time is after block 0")
    }

    #[tokio::test]
    async fn finds_latest_block_at_or_before_time() {
        let harness = Harness::new();
        uneven_chain(&harness);
        let service = harness.service();
        service
            .process_block_header(&harness.node.head())
            .expect("should set head");
        let head_time = harness.node.head().timestamp;

        for time in (GENESIS_TIMESTAMP..=head_time).step_by(7) {
            let header = service
                .block_by_timestamp(time)
                .await
                .expect("should find block");
            assert_eq!(header.number, expected_block(&harness, time), "time {}", time);
        }

        let header = service
            .block_by_timestamp(head_time)
            .await
            .expect("should find head");
        assert_eq!(header.number, 120);
    }

    #[tokio::test]
    async fn repeated_search_is_served_from_cache() {
        let harness = Harness::new();
        uneven_chain(&harness);
        let service = harness.service();
        service
            .process_block_header(&harness.node.head())
            .expect("should set head");

        let time = GENESIS_TIMESTAMP + 133;
        let first = service.block_by_timestamp(time).await.expect("should find block");
        let requests = harness.node.header_requests();
        let second = service.block_by_timestamp(time).await.expect("should find block");
        assert_eq!(first, second);
        assert_eq!(harness.node.header_requests(), requests);
    }

    #[tokio::test]
    async fn out_of_range_times() {
        let harness = Harness::new();
        uneven_chain(&harness);
        let service = harness.service();
        service
            .process_block_header(&harness.node.head())
            .expect("should set head");
        let head_time = harness.node.head().timestamp;

        assert_eq!(
            service.block_by_timestamp(head_time + 1).await,
            Err(Error::TimeTooLate {
                requested: head_time + 1,
                latest: head_time
            })
        );
        assert_eq!(
            service.block_by_timestamp(GENESIS_TIMESTAMP - 1).await,
            Err(Error::NoBlockBeforeTimestamp {
                time: GENESIS_TIMESTAMP - 1
            })
        );
    }

    #[tokio::test]
    async fn estimates_below_block_zero_narrow_the_search() {
        let harness = Harness::new();
        // A long pause after block 0, then regular blocks up to 100.
        for i in 1..=100u64 {
            harness.node.mine_block_at(GENESIS_TIMESTAMP + 1_000 + 2 * i);
        }
        let service = harness.service();
        service
            .process_block_header(&harness.node.head())
            .expect("should set head");

        for (time, expected) in [
            (GENESIS_TIMESTAMP + 500, 0),
            (GENESIS_TIMESTAMP + 1_002, 1),
            (GENESIS_TIMESTAMP + 1_061, 30),
        ] {
            let requests = harness.node.header_requests();
            let header = service
                .block_by_timestamp(time)
                .await
                .expect("should find block");
            assert_eq!(header.number, expected, "time {}", time);
            // Far fewer lookups than walking down from the head.
            assert!(harness.node.header_requests() - requests < 20, "time {}", time);
        }
    }

    #[tokio::test]
    async fn head_timestamp_near_overflow() {
        let harness = Harness::new();
        harness.node.mine_blocks(10);
        let head = harness.node.mine_block_at(u64::MAX - 1);
        let service = harness.service();
        service
            .process_block_header(&harness.node.head())
            .expect("should set head");

        let target = harness.node.header(5).expect("block 5 is mined");
        let found = service
            .block_by_timestamp(target.timestamp)
            .await
            .expect("should find block");
        assert_eq!(found, target);
        let found = service
            .block_by_timestamp(u64::MAX - 1)
            .await
            .expect("should find head");
        assert_eq!(found.number, head);
    }

    #[tokio::test]
    async fn short_chain_follows_nothing() {
        let harness = Harness::new();
        let service = harness.service();
        service
            .process_block_header(&harness.node.head())
            .expect("should set head");
        // A chain shorter than the follow distance follows its head.
        let follow = service.followed_block_height().await.expect("should follow");
        assert_eq!(follow, 0);
    }
}

mod chain_start {
    use super::*;

    #[tokio::test]
    async fn starts_when_enough_validators() {
        let harness = Harness::new();
        let validators = harness.spec.min_genesis_active_validator_count;
        harness.mine_deposits(0..validators, 40);
        let service = harness.service();
        let mut chain_start = service.subscribe_chain_start();

        service.init_service().await.expect("should initialize");

        assert!(service.is_chain_started());
        let expected_time = GENESIS_TIMESTAMP + 2 + harness.spec.genesis_delay;
        assert_eq!(
            chain_start.try_recv().expect("chain start was announced"),
            ChainStartedEvent {
                genesis_time: expected_time,
                block_hash: mock_block_hash(1),
                block_number: 1,
            }
        );

        let data = service.chain_start_data();
        assert_eq!(data.genesis_block, 1);
        assert_eq!(data.genesis_time, expected_time);
        assert_eq!(data.execution_data.deposit_count, validators);
        assert_eq!(data.execution_data.deposit_root, service.deposit_root());
        assert_eq!(data.chainstart_deposits.len() as u64, validators);
        for (i, deposit) in data.chainstart_deposits.iter().enumerate() {
            assert!(verify_merkle_proof(
                deposit.data.tree_hash_root(),
                &deposit.proof,
                DEPOSIT_CONTRACT_TREE_DEPTH + 1,
                i,
                data.execution_data.deposit_root,
            ));
        }

        let persisted = harness
            .db
            .execution_chain_data()
            .unwrap()
            .expect("chain start is persisted");
        assert!(persisted.chainstart_data.chain_started);
    }

    #[tokio::test]
    async fn deposits_after_chain_start_are_pending() {
        let harness = Harness::new();
        let validators = harness.spec.min_genesis_active_validator_count;
        harness.mine_deposits(0..validators, 40);
        let service = harness.service();
        service.init_service().await.expect("should initialize");
        assert!(service.is_chain_started());

        harness.mine_deposits(validators..validators + 1, 20);
        service.update().await.expect("should update");

        assert_eq!(service.deposit_count(), validators + 1);
        assert_eq!(service.chain_start_data().execution_data.deposit_count, validators);
        let pending = service.deposit_cache().pending_deposits(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, deposit_data(validators, MAX_DEPOSIT));
    }

    #[test]
    fn no_endpoint_and_no_genesis_state() {
        let harness = Harness::new();
        let service = harness.service();
        assert_eq!(service.start().err(), Some(Error::NoGenesisState));
    }
}

mod recovery {
    use super::*;

    fn genesis_state() -> BeaconState {
        let mut state = BeaconState::new(
            GENESIS_TIMESTAMP + 302,
            ExecutionData {
                deposit_root: Hash256::repeat_byte(3),
                deposit_count: 2,
                block_hash: mock_block_hash(1),
            },
        );
        state.execution_deposit_index = 2;
        state
    }

    #[tokio::test]
    async fn synthesizes_chain_data_from_genesis_state() {
        let harness = Harness::new();
        harness.mine_deposits(0..2, 40);
        harness
            .db
            .put_genesis_state(&genesis_state())
            .expect("should store genesis state");

        let service = harness.service();
        let data = service.chain_start_data();
        assert!(data.chain_started);
        assert_eq!(data.genesis_time, genesis_state().genesis_time);
        assert_eq!(data.execution_data, genesis_state().execution_data);
        assert_eq!(service.deposit_count(), 0);
        assert!(harness.db.execution_chain_data().unwrap().is_some());

        service.init_service().await.expect("should initialize");

        // Deposits are re-requested from the deploy block.
        assert_eq!(service.deposit_count(), 2);
        assert_eq!(service.deposit_cache().pending_deposits(None).len(), 2);
        // The genesis block height is resolved from its hash.
        assert_eq!(service.chain_start_data().genesis_block, 1);
    }

    #[tokio::test]
    async fn prunes_finalized_deposits_on_restart() {
        let harness = Harness::new();
        harness.mine_deposits(0..3, 40);
        harness
            .db
            .put_genesis_state(&genesis_state())
            .expect("should store genesis state");
        let service = harness.service();
        service.init_service().await.expect("should initialize");
        service
            .save_execution_chain_data()
            .expect("should save chain data");

        let finalized_root = Hash256::repeat_byte(0xf1);
        let mut finalized_state = genesis_state();
        finalized_state.slot = harness.spec.slots_per_epoch;
        harness
            .db
            .put_state(&finalized_root, &finalized_state)
            .expect("should store state");
        harness
            .db
            .put_finalized_checkpoint(&Checkpoint {
                epoch: 1,
                root: finalized_root,
            })
            .expect("should store checkpoint");

        let restored = harness.service();
        assert_eq!(restored.deposit_count(), 3);
        assert_eq!(restored.deposit_root(), service.deposit_root());
        let pending = restored.deposit_cache().pending_deposits(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, deposit_data(2, MAX_DEPOSIT));
        let finalized = restored
            .deposit_cache()
            .finalized_deposits()
            .expect("deposits are finalized");
        assert_eq!(finalized.merkle_trie_index, 1);
        let snapshot = restored.deposit_snapshot().expect("snapshot tree in use");
        assert_eq!(snapshot.deposit_count, 2);
    }

    #[test]
    fn missing_finalized_state_is_fatal() {
        let harness = Harness::new();
        harness
            .db
            .put_genesis_state(&genesis_state())
            .expect("should store genesis state");
        let service = harness.service();
        let log = deposit_log(deposit_contract(), 1, 0, &deposit_data(0, MAX_DEPOSIT), 0);
        service.process_log(&log).expect("should apply log");
        service
            .save_execution_chain_data()
            .expect("should save chain data");

        let root = Hash256::repeat_byte(0xf2);
        harness
            .db
            .put_finalized_checkpoint(&Checkpoint { epoch: 1, root })
            .expect("should store checkpoint");

        let result = harness.service_with(harness.config(), None);
        let error = result.err().expect("restart should fail");
        assert_eq!(error, Error::FinalizedStateMissing { root });
        assert_eq!(error.kind(), ErrorKind::Fatal);
    }
}

mod deposit_tree {
    use super::*;

    #[tokio::test]
    async fn finalization_survives_restart() {
        let harness = Harness::new();
        harness.mine_deposits(0..3, 40);
        let service = harness.service();
        service.init_service().await.expect("should initialize");
        let root = service.deposit_root();

        let request = FinalizationRequest {
            deposit_index: 2,
            block_hash: mock_block_hash(1),
            block_number: 1,
        };
        assert_eq!(service.finalize_deposits(request), Ok(true));
        assert_eq!(service.finalize_deposits(request), Ok(false));

        assert_eq!(service.deposit_root(), root);
        assert!(service.deposit_proof(0).is_err());
        assert!(service.deposit_proof(2).is_ok());
        let snapshot = service.deposit_snapshot().expect("snapshot tree in use");
        assert_eq!(snapshot.deposit_count, 2);
        assert_eq!(snapshot.execution_block_height, 1);

        service
            .save_execution_chain_data()
            .expect("should save chain data");
        let restored = harness.service();
        assert_eq!(restored.deposit_root(), root);
        assert_eq!(restored.deposit_count(), 3);
        let restored_snapshot = restored.deposit_snapshot().expect("snapshot tree in use");
        assert_eq!(restored_snapshot.deposit_count, snapshot.deposit_count);
        assert_eq!(restored_snapshot.deposit_root, snapshot.deposit_root);
        assert_eq!(restored_snapshot.execution_block_hash, mock_block_hash(1));
    }

    fn legacy_record(leaves: u64) -> SparseTrieRecord {
        let mut trie = SparseDepositTrie::new();
        for i in 0..leaves {
            trie.insert(Hash256::from_low_u64_be(i + 1), i)
                .expect("should insert leaf");
        }
        SparseTrieRecord {
            depth: DEPOSIT_CONTRACT_TREE_DEPTH as u64,
            leaves: trie.leaves().to_vec(),
            deposit_root: trie.hash_tree_root(),
        }
    }

    #[test]
    fn migrates_legacy_trie() {
        let harness = Harness::new();
        let record = legacy_record(1000);
        let legacy_root = SparseDepositTrie::from_record(&record)
            .expect("valid record")
            .hash_tree_root();
        assert_eq!(legacy_root, record.deposit_root);
        harness
            .db
            .save_execution_chain_data(&ExecutionChainData {
                trie: Some(record),
                ..ExecutionChainData::default()
            })
            .expect("should save chain data");

        let service = harness.service();
        assert_eq!(service.deposit_tree_kind(), DepositTreeKind::Snapshot);
        assert_eq!(service.deposit_count(), 1000);
        assert_eq!(service.deposit_root(), legacy_root);

        // The migrated tree is written back in the new format.
        let persisted = harness
            .db
            .execution_chain_data()
            .unwrap()
            .expect("chain data is persisted");
        assert!(persisted.trie.is_none());
        assert!(persisted.deposit_snapshot.is_some());
    }

    #[test]
    fn damaged_legacy_trie_aborts_migration() {
        let harness = Harness::new();
        let mut record = legacy_record(4);
        let legacy_root = record.deposit_root;
        record.leaves[2] = Hash256::repeat_byte(0xff);
        harness
            .db
            .save_execution_chain_data(&ExecutionChainData {
                trie: Some(record.clone()),
                ..ExecutionChainData::default()
            })
            .expect("should save chain data");

        match harness.service_with(harness.config(), None) {
            Err(Error::MigrationRootMismatch { legacy, migrated }) => {
                assert_eq!(legacy, legacy_root);
                assert_ne!(migrated, legacy_root);
            }
            Err(e) => panic!("expected a root mismatch, got {:?}", e),
            Ok(_) => panic!("damaged trie should not be migrated"),
        }

        // The legacy record is left in place.
        let persisted = harness
            .db
            .execution_chain_data()
            .unwrap()
            .expect("chain data is persisted");
        assert_eq!(persisted.trie, Some(record));
        assert!(persisted.deposit_snapshot.is_none());
    }

    #[test]
    fn sparse_config_keeps_legacy_trie() {
        let harness = Harness::new();
        let record = legacy_record(10);
        harness
            .db
            .save_execution_chain_data(&ExecutionChainData {
                trie: Some(record.clone()),
                ..ExecutionChainData::default()
            })
            .expect("should save chain data");

        let config = Config {
            deposit_tree_kind: DepositTreeKind::Sparse,
            ..harness.config()
        };
        let service = harness
            .service_with(config, None)
            .expect("should build service");
        assert_eq!(service.deposit_tree_kind(), DepositTreeKind::Sparse);
        assert_eq!(service.deposit_count(), 10);
        assert!(service.deposit_snapshot().is_none());
        assert_eq!(service.execution_chain_data().trie, Some(record));
    }

    #[test]
    fn snapshot_cannot_be_loaded_as_sparse() {
        let harness = Harness::new();
        harness
            .db
            .save_execution_chain_data(&ExecutionChainData {
                deposit_snapshot: Some(execution_chain::SnapshotDepositTree::new().snapshot()),
                ..ExecutionChainData::default()
            })
            .expect("should save chain data");

        let config = Config {
            deposit_tree_kind: DepositTreeKind::Sparse,
            ..harness.config()
        };
        assert_eq!(
            harness.service_with(config, None).err(),
            Some(Error::WrongTreeKind {
                configured: DepositTreeKind::Sparse
            })
        );
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let harness = Harness::new();
        harness
            .db
            .save_execution_chain_data(&ExecutionChainData {
                deposit_snapshot: Some(DepositTreeSnapshot {
                    deposit_count: 5,
                    ..DepositTreeSnapshot::default()
                }),
                ..ExecutionChainData::default()
            })
            .expect("should save chain data");

        let error = harness.service_with(harness.config(), None).err();
        assert!(matches!(error, Some(Error::InvalidSnapshot(_))));
    }
}
