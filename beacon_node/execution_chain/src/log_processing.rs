//! Ingestion of deposit contract logs: historical catch-up in adaptive batches, then block by
//! block tailing of the followed head.

use crate::deposit_log::DepositLog;
use crate::genesis;
use crate::metrics;
use crate::rpc::{BlockHeader, FilterQuery, Log, DEPOSIT_EVENT_TOPIC};
use crate::service::{ChainStartedEvent, Error, Service};
use slog::{debug, error, info};
use std::collections::HashMap;
use tree_hash::TreeHash;
use types::{Deposit, ExecutionData, Hash256};

/// Fraction of the maximum batch size regained after each successful batch.
const ADDITIVE_FACTOR_DIVISOR: u64 = 10;
const MULTIPLICATIVE_DECREASE_DIVISOR: u64 = 2;
/// Progress is logged every this-many deposits before chain start.
const DEPOSIT_PROGRESS_LOG_INTERVAL: usize = 512;

impl Service {
    /// Catches up on deposit logs from the last requested block to `follow_block`, requesting
    /// logs over block ranges that adapt to what the execution node will serve.
    pub async fn process_past_logs(&self, follow_block: u64) -> Result<(), Error> {
        let config = &self.inner.config;
        let mut current_block = std::cmp::max(
            self.latest_execution_data().last_requested_block,
            config.deposit_contract_deploy_block,
        );
        let log_count = self
            .inner
            .rpc
            .deposit_count(config.deposit_contract_address, None)
            .await?;

        let max_batch_size = config.max_log_batch_size.max(1);
        let additive_factor = (max_batch_size / ADDITIVE_FACTOR_DIVISOR).max(1);
        let mut batch_size = max_batch_size;

        while current_block < follow_block {
            self.check_cancelled()?;
            let (next_block, next_batch_size) = self
                .process_block_in_batch(
                    current_block,
                    follow_block,
                    batch_size,
                    max_batch_size,
                    additive_factor,
                    log_count,
                )
                .await?;
            current_block = next_block;
            batch_size = next_batch_size;
            self.inner
                .metrics
                .set_gauge(metrics::LOG_BATCH_SIZE, batch_size as i64);
        }

        self.set_last_requested_block(current_block);
        self.prune_pending_deposits_from_finalized_state()
    }

    /// Requests and applies the logs of one batch. Returns where the next batch starts and its
    /// size.
    async fn process_block_in_batch(
        &self,
        current_block: u64,
        follow_block: u64,
        batch_size: u64,
        max_batch_size: u64,
        additive_factor: u64,
        log_count: u64,
    ) -> Result<(u64, u64), Error> {
        let config = &self.inner.config;
        let start = current_block;
        let mut end = current_block.saturating_add(batch_size).min(follow_block);

        // Avoid leaving a short trailing batch when few logs remain.
        let received = (self.last_received_merkle_index() + 1) as u64;
        let remaining_logs = log_count.saturating_sub(received);
        if remaining_logs < config.deposit_log_request_limit
            && end.saturating_add(batch_size) >= follow_block
        {
            end = follow_block;
        }

        let query = FilterQuery {
            from_block: start,
            to_block: end,
            addresses: vec![config.deposit_contract_address],
        };
        let mut logs = match self.inner.rpc.filter_logs(&query).await {
            Ok(logs) => logs,
            Err(e) if e.is_too_much_data(&config.too_much_data_patterns) => {
                if batch_size == 0 {
                    return Err(Error::ZeroBatchSize { from_block: start });
                }
                let batch_size = batch_size / MULTIPLICATIVE_DECREASE_DIVISOR;
                debug!(
                    self.log,
                    "Log request too large, reducing batch size";
                    "from_block" => start,
                    "to_block" => end,
                    "batch_size" => batch_size,
                );
                return Ok((current_block, batch_size));
            }
            Err(e) => return Err(e.into()),
        };
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        // Headers are only needed to detect chain start.
        let mut headers = HashMap::new();
        if !self.is_chain_started() {
            self.request_headers(start, end, &mut headers).await?;
        }

        let last_requested_before_batch = self.latest_execution_data().last_requested_block;
        let mut current_block = current_block;
        for log in &logs {
            if log.block_number > current_block {
                self.check_header_range(current_block, log.block_number - 1, &mut headers)
                    .await?;
                self.set_last_requested_block(current_block);
                current_block = log.block_number;
            }
            if let Err(e) = self.process_log(log) {
                // A bad log invalidates the whole batch.
                self.set_last_requested_block(last_requested_before_batch);
                return Err(e);
            }
        }
        self.check_header_range(current_block, end, &mut headers)
            .await?;

        let batch_size = if batch_size < max_batch_size {
            batch_size.saturating_add(additive_factor).min(max_batch_size)
        } else {
            batch_size
        };

        if !logs.is_empty() {
            info!(
                self.log,
                "Imported deposit log(s)";
                "latest_block" => end,
                "total" => self.deposit_count(),
                "new" => logs.len(),
            );
        }
        Ok((end, batch_size))
    }

    async fn request_headers(
        &self,
        start: u64,
        end: u64,
        headers: &mut HashMap<u64, BlockHeader>,
    ) -> Result<(), Error> {
        for header in self.batch_request_headers(start, end).await? {
            headers.insert(header.number, header);
        }
        Ok(())
    }

    /// Checks each block in `start..=end` for chain start, until the chain has started.
    async fn check_header_range(
        &self,
        start: u64,
        end: u64,
        headers: &mut HashMap<u64, BlockHeader>,
    ) -> Result<(), Error> {
        for number in start..=end {
            if self.is_chain_started() {
                return Ok(());
            }
            if !headers.contains_key(&number) {
                self.request_headers(number, number, headers).await?;
            }
            let header = headers.get(&number).ok_or(Error::HeaderNotFound {
                block_number: number,
            })?;
            self.process_chain_start_if_ready(header.hash, header.number, header.timestamp)?;
        }
        Ok(())
    }

    /// Follows the head one block at a time, falling back to `process_past_logs` when too far
    /// behind.
    pub async fn request_batched_headers_and_logs(&self) -> Result<(), Error> {
        let requested_block = self.followed_block_height().await?;
        let last_requested_block = self.latest_execution_data().last_requested_block;

        if requested_block > last_requested_block
            && requested_block - last_requested_block > self.inner.config.max_tolerable_difference
        {
            info!(
                self.log,
                "Falling back to historical headers and logs sync";
                "difference" => requested_block - last_requested_block,
            );
            return self.process_past_logs(requested_block).await;
        }

        for number in last_requested_block.saturating_add(1)..=requested_block {
            self.check_cancelled()?;
            self.retrieve_header_info(number).await?;
            self.process_execution_block(number).await?;
            self.set_last_requested_block(number);
        }
        Ok(())
    }

    /// Applies the deposit logs of a single block, then checks it for chain start.
    pub async fn process_execution_block(&self, number: u64) -> Result<(), Error> {
        let query = FilterQuery {
            from_block: number,
            to_block: number,
            addresses: vec![self.inner.config.deposit_contract_address],
        };
        let mut logs = self.inner.rpc.filter_logs(&query).await?;
        logs.sort_by_key(|log| log.log_index);

        for log in logs.iter().filter(|log| log.block_number == number) {
            self.process_log(log)?;
        }

        if !self.is_chain_started() {
            self.process_chain_start_from_block_number(number).await?;
        }
        Ok(())
    }

    /// Applies a single contract log. Logs of other events are ignored.
    pub fn process_log(&self, log: &Log) -> Result<(), Error> {
        let _processing = self.inner.processing.read();

        if log.topics.first() != Some(&DEPOSIT_EVENT_TOPIC) {
            debug!(self.log, "Not a valid event signature"; "topics" => ?log.topics);
            return Ok(());
        }
        if log.removed {
            debug!(self.log, "Ignoring removed log"; "block_number" => log.block_number);
            return Ok(());
        }

        if self.process_deposit_log(log)? {
            let interval = self.inner.config.execution_data_saving_interval.max(1);
            let last_received = self.last_received_merkle_index();
            if last_received >= 0 && last_received as u64 % interval == 0 {
                self.save_execution_chain_data()?;
            }
        }
        Ok(())
    }

    /// Appends a deposit log to the deposit tree and deposit cache, and before chain start to the
    /// pre-genesis state.
    ///
    /// Returns `false` if the log was already applied.
    pub(crate) fn process_deposit_log(&self, log: &Log) -> Result<bool, Error> {
        let deposit_log =
            DepositLog::from_log(log).map_err(|error| Error::FailedToParseDepositLog {
                block_number: log.block_number,
                error,
            })?;
        let index = deposit_log.index;

        let mut guard = self.inner.deposits.write();
        let deposits = &mut *guard;

        let expected = (deposits.last_received_merkle_index + 1) as u64;
        if index < expected {
            return Ok(false);
        }
        if index != expected {
            drop(guard);
            self.inner.metrics.inc_counter(metrics::MISSED_DEPOSIT_LOGS);
            return Err(Error::MissedDepositLog {
                expected,
                received: index,
            });
        }
        let num_of_items = deposits.tree.num_of_items();
        if num_of_items != index {
            return Err(Error::DepositIndexMismatch {
                num_of_items,
                index,
            });
        }

        deposits
            .tree
            .insert(deposit_log.deposit_data.tree_hash_root(), index)?;
        deposits.last_received_merkle_index = index as i64;

        let chain_started = deposits.chain_start_data.chain_started;
        let mut deposit = Deposit {
            proof: vec![],
            data: deposit_log.deposit_data,
        };
        // Proofs are only needed until genesis.
        if !chain_started {
            deposit.proof = deposits.tree.merkle_proof(index)?;
        }

        let deposit_root = deposits.tree.hash_tree_root();
        let deposit_count = deposits.tree.num_of_items();
        self.inner.deposit_cache.insert_deposit(
            deposit.clone(),
            log.block_number,
            index,
            deposit_root,
        )?;

        let mut valid = true;
        if chain_started {
            self.inner.deposit_cache.insert_pending_deposit(
                deposit,
                log.block_number,
                index,
                deposit_root,
            );
        } else {
            deposits
                .chain_start_data
                .chainstart_deposits
                .push(deposit.clone());
            if let Err(e) = deposits.pre_genesis_state.process_deposit(
                &deposit,
                deposit_root,
                deposit_count,
                log.block_hash,
                &self.inner.spec,
            ) {
                error!(self.log, "Invalid deposit processed"; "error" => ?e, "index" => index);
                valid = false;
            }
        }
        let chainstart_deposits = deposits.chain_start_data.chainstart_deposits.len();
        let active_validators = deposits.pre_genesis_state.active_validator_count();
        drop(guard);

        self.inner
            .metrics
            .set_gauge(metrics::DEPOSIT_COUNT, deposit_count as i64);
        if valid {
            debug!(
                self.log,
                "Deposit registered from deposit contract";
                "index" => index,
                "block_number" => log.block_number,
            );
            self.inner.metrics.inc_counter(metrics::VALID_DEPOSIT_LOGS);
            if !chain_started && chainstart_deposits % DEPOSIT_PROGRESS_LOG_INTERVAL == 0 {
                info!(
                    self.log,
                    "Processing deposits from execution chain";
                    "deposits" => chainstart_deposits,
                    "active_validators" => active_validators,
                );
            }
        } else {
            info!(
                self.log,
                "Invalid deposit registered in deposit contract";
                "index" => index,
                "block_number" => log.block_number,
            );
        }
        Ok(true)
    }

    pub(crate) async fn process_chain_start_from_block_number(
        &self,
        number: u64,
    ) -> Result<(), Error> {
        let header = self.retrieve_header_info(number).await?;
        self.process_chain_start_if_ready(header.hash, header.number, header.timestamp)
    }

    /// Starts the chain on this block if the pre-genesis state meets the genesis conditions.
    pub(crate) fn process_chain_start_if_ready(
        &self,
        block_hash: Hash256,
        block_number: u64,
        block_time: u64,
    ) -> Result<(), Error> {
        let (validator_count, genesis_time) = self.current_count_and_time(block_time);
        if validator_count == 0 {
            return Ok(());
        }
        if genesis::is_valid_genesis_state(validator_count, genesis_time, &self.inner.spec) {
            self.process_chain_start(genesis_time, block_hash, block_number)?;
        }
        Ok(())
    }

    /// Marks the chain as started, refreshing every chain start deposit's proof against the final
    /// deposit root.
    fn process_chain_start(
        &self,
        genesis_time: u64,
        block_hash: Hash256,
        block_number: u64,
    ) -> Result<(), Error> {
        {
            let mut guard = self.inner.deposits.write();
            let deposits = &mut *guard;
            if deposits.chain_start_data.chain_started {
                return Ok(());
            }

            for (i, deposit) in deposits
                .chain_start_data
                .chainstart_deposits
                .iter_mut()
                .enumerate()
            {
                deposit.proof = deposits.tree.merkle_proof(i as u64)?;
            }

            let chain_start = &mut deposits.chain_start_data;
            chain_start.chain_started = true;
            chain_start.genesis_time = genesis_time;
            chain_start.genesis_block = block_number;
            chain_start.execution_data = ExecutionData {
                deposit_root: deposits.tree.hash_tree_root(),
                deposit_count: chain_start.chainstart_deposits.len() as u64,
                block_hash,
            };
        }

        info!(
            self.log,
            "Minimum number of validators reached for beacon-chain to start";
            "genesis_time" => genesis_time,
            "block_hash" => ?block_hash,
            "block_number" => block_number,
        );
        // Nobody listening is fine.
        let _ = self.inner.chain_start_tx.send(ChainStartedEvent {
            genesis_time,
            block_hash,
            block_number,
        });

        // Saved again on the next interval if this fails.
        if let Err(e) = self.save_execution_chain_data() {
            error!(self.log, "Failed to save execution chain data"; "error" => ?e);
        }
        Ok(())
    }

    fn set_last_requested_block(&self, block_number: u64) {
        self.inner.latest.write().last_requested_block = block_number;
        self.inner
            .metrics
            .set_gauge(metrics::LAST_REQUESTED_BLOCK, block_number as i64);
    }

    /// Drops pending deposits already included in the finalized state.
    fn prune_pending_deposits_from_finalized_state(&self) -> Result<(), Error> {
        let checkpoint = match self.inner.db.finalized_checkpoint()? {
            Some(checkpoint) if !checkpoint.is_genesis_placeholder() => checkpoint,
            _ => return Ok(()),
        };

        let slots_per_epoch = self.inner.spec.slots_per_epoch.max(1);
        let startup_index = self
            .inner
            .finalized_state_at_startup
            .read()
            .as_ref()
            .filter(|state| state.slot / slots_per_epoch == checkpoint.epoch)
            .map(|state| state.execution_deposit_index);
        let deposit_index = match startup_index {
            Some(index) => Some(index),
            None => self
                .inner
                .db
                .state_by_root(&checkpoint.root)?
                .map(|state| state.execution_deposit_index),
        };

        if let Some(index) = deposit_index.filter(|index| *index > 0) {
            self.inner.deposit_cache.prune_pending_deposits(index);
        }
        Ok(())
    }
}
