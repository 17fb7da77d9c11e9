//! Persisting and restoring the execution chain data record.

use crate::deposit_tree::{
    deposit_tree_from_record, new_deposit_tree, DepositTreeKind, DepositTreeRecord,
    Error as DepositTreeError,
};
use crate::genesis::PreGenesisState;
use crate::inner::DepositState;
use crate::metrics;
use crate::service::{Error, Service};
use slog::{debug, info};
use tree_hash::TreeHash;
use types::{ChainStartData, DepositContainer, ExecutionChainData, Hash256, LatestExecutionData};

/// Returns `true` if the containers are exactly the deposits `0..containers.len()`, in any order.
pub fn validate_deposit_containers(containers: &[DepositContainer]) -> bool {
    let mut indices = containers
        .iter()
        .map(|container| container.index)
        .collect::<Vec<_>>();
    indices.sort_unstable();
    indices
        .iter()
        .enumerate()
        .all(|(expected, index)| *index == expected as u64)
}

impl Service {
    /// Builds the record that `save_execution_chain_data` persists.
    pub fn execution_chain_data(&self) -> ExecutionChainData {
        let current_execution_data = self.latest_execution_data();
        // Read the cache under the deposits lock so both describe the same deposits.
        let deposits = self.inner.deposits.read();
        let deposit_containers = self.inner.deposit_cache.all_deposit_containers();
        let (trie, deposit_snapshot) = match deposits.tree.to_record() {
            DepositTreeRecord::SparseTrie(record) => (Some(record), None),
            DepositTreeRecord::Snapshot(snapshot) => (None, Some(snapshot)),
        };

        ExecutionChainData {
            current_execution_data,
            chainstart_data: deposits.chain_start_data.clone(),
            beacon_state: Some(deposits.pre_genesis_state.state().clone()),
            deposit_containers,
            trie,
            deposit_snapshot,
        }
    }

    /// Writes the execution chain data record to the database.
    pub fn save_execution_chain_data(&self) -> Result<(), Error> {
        let data = self.execution_chain_data();
        self.inner.db.save_execution_chain_data(&data)?;
        debug!(
            self.log,
            "Saved execution chain data";
            "deposits" => data.deposit_containers.len(),
            "last_requested_block" => data.current_execution_data.last_requested_block,
        );
        Ok(())
    }

    /// If the node has a genesis state but no usable chain data, writes chain data derived from
    /// the genesis state. The deposit logs are then re-requested from the deploy block.
    pub(crate) fn ensure_valid_chain_data(&self) -> Result<(), Error> {
        let Some(genesis_state) = self.inner.db.genesis_state()? else {
            return Ok(());
        };

        match self.inner.db.execution_chain_data()? {
            Some(data)
                if data.chainstart_data.chain_started
                    && validate_deposit_containers(&data.deposit_containers) =>
            {
                return Ok(())
            }
            Some(data) if data.chainstart_data.chain_started => info!(
                self.log,
                "Recovering missing deposit containers";
                "info" => "node is re-requesting missing deposit data",
                "persisted_deposits" => data.deposit_containers.len(),
            ),
            _ => info!(
                self.log,
                "Recovering execution chain data from the genesis state";
                "genesis_time" => genesis_state.genesis_time,
            ),
        }

        {
            let mut deposits = self.inner.deposits.write();
            *deposits = DepositState::new(&self.inner.config);
            deposits.chain_start_data = ChainStartData {
                chain_started: true,
                genesis_time: genesis_state.genesis_time,
                genesis_block: 0,
                execution_data: genesis_state.execution_data.clone(),
                chainstart_deposits: vec![],
            };
        }
        *self.inner.latest.write() = LatestExecutionData {
            last_requested_block: self.inner.config.deposit_contract_deploy_block,
            ..LatestExecutionData::default()
        };
        self.save_execution_chain_data()
    }

    /// Restores the deposit tree, chain start data, pre-genesis state and deposit cache from a
    /// persisted record.
    pub(crate) fn initialize_from_chain_data(&self, data: ExecutionChainData) -> Result<(), Error> {
        let kind = self.inner.config.deposit_tree_kind;
        let record = match (data.deposit_snapshot, data.trie) {
            (Some(snapshot), _) => Some(DepositTreeRecord::Snapshot(snapshot)),
            (None, Some(trie)) => Some(DepositTreeRecord::SparseTrie(trie)),
            (None, None) => None,
        };
        let migrating = kind == DepositTreeKind::Snapshot
            && matches!(record, Some(DepositTreeRecord::SparseTrie(_)));

        let mut tree = match record {
            Some(record) => deposit_tree_from_record(kind, record).map_err(|e| match e {
                DepositTreeError::WrongTreeKind { .. } => Error::WrongTreeKind { configured: kind },
                e => e.into(),
            })?,
            None => new_deposit_tree(kind),
        };

        let mut containers = data.deposit_containers;
        containers.sort_by_key(|container| container.index);
        // Deposits cached after the tree was last written.
        let persisted_items = tree.num_of_items();
        for container in containers
            .iter()
            .filter(|container| container.index >= persisted_items)
        {
            tree.insert(container.deposit.data.tree_hash_root(), container.index)?;
        }

        let num_of_items = tree.num_of_items();
        {
            let mut deposits = self.inner.deposits.write();
            *deposits = DepositState {
                tree,
                last_received_merkle_index: num_of_items as i64 - 1,
                chain_start_data: data.chainstart_data,
                pre_genesis_state: data
                    .beacon_state
                    .map(PreGenesisState::from_state)
                    .unwrap_or_default(),
            };
        }
        *self.inner.latest.write() = data.current_execution_data;
        self.inner
            .metrics
            .set_gauge(metrics::DEPOSIT_COUNT, num_of_items as i64);

        self.init_deposit_caches(containers)?;

        if migrating {
            info!(
                self.log,
                "Migrated deposit tree to snapshot format";
                "deposit_count" => num_of_items,
                "deposit_root" => ?self.deposit_root(),
            );
            self.save_execution_chain_data()?;
        }
        Ok(())
    }

    /// Loads the persisted deposits into the deposit cache and marks as pending every deposit the
    /// finalized state has not yet included.
    fn init_deposit_caches(&self, containers: Vec<DepositContainer>) -> Result<(), Error> {
        if containers.is_empty() {
            return Ok(());
        }
        let cache = &self.inner.deposit_cache;
        cache.insert_deposit_containers(containers.clone());
        if !self.is_chain_started() {
            return Ok(());
        }

        let mut current_index = self
            .inner
            .db
            .genesis_state()?
            .map_or(0, |state| state.execution_deposit_index);

        if let Some(checkpoint) = self
            .inner
            .db
            .finalized_checkpoint()?
            .filter(|checkpoint| !checkpoint.is_genesis_placeholder())
        {
            let (deposit_index, block_hash) = self.finalized_deposit_position(checkpoint.root)?;
            current_index = deposit_index;

            if let Some(last_index) = deposit_index.checked_sub(1) {
                cache.insert_finalized_deposits(last_index, block_hash, 0)?;
                cache.prune_proofs(last_index);
                let mut deposits = self.inner.deposits.write();
                if last_index < deposits.tree.num_of_items() {
                    deposits.tree.finalize(last_index, block_hash, 0)?;
                }
            }
        }

        for container in containers
            .into_iter()
            .filter(|container| container.index >= current_index)
        {
            cache.insert_pending_deposit(
                container.deposit,
                container.execution_block_height,
                container.index,
                container.deposit_root,
            );
        }
        Ok(())
    }

    /// The deposit index and execution block hash of the finalized state with `root`.
    fn finalized_deposit_position(&self, root: Hash256) -> Result<(u64, Hash256), Error> {
        if let Some(state) = self.inner.finalized_state_at_startup.read().as_ref() {
            return Ok((
                state.execution_deposit_index,
                state.execution_data.block_hash,
            ));
        }
        self.inner
            .db
            .state_by_root(&root)?
            .map(|state| (state.execution_deposit_index, state.execution_data.block_hash))
            .ok_or(Error::FinalizedStateMissing { root })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(index: u64) -> DepositContainer {
        DepositContainer {
            index,
            ..DepositContainer::default()
        }
    }

    #[test]
    fn contiguous_containers() {
        assert!(validate_deposit_containers(&[]));
        assert!(validate_deposit_containers(&[
            container(2),
            container(0),
            container(1)
        ]));
    }

    #[test]
    fn containers_with_gaps() {
        assert!(!validate_deposit_containers(&[container(0), container(2)]));
        assert!(!validate_deposit_containers(&[container(1)]));
        assert!(!validate_deposit_containers(&[container(0), container(0)]));
    }
}
