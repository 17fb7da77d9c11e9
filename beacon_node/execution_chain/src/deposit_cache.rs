use parking_lot::RwLock;
use types::{Deposit, DepositContainer, Hash256};

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// A deposit was inserted with an index that was not the next expected index.
    NonConsecutive { deposit_index: u64, expected: u64 },
    /// A deposit was inserted with an index already known, but with different contents.
    DuplicateDistinctDeposit { deposit_index: u64 },
    /// Attempted to finalize a deposit that is not in the cache.
    UnknownDeposit { deposit_index: u64, known_deposits: u64 },
}

/// The most recent deposit known to be finalized by the beacon chain.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct FinalizedDeposits {
    /// Index of the last finalized deposit.
    pub merkle_trie_index: u64,
    pub deposit_root: Hash256,
    pub block_hash: Hash256,
    pub block_number: u64,
}

/// Stores every observed deposit, plus the pending subset not yet included in the beacon chain.
pub trait DepositCache: Send + Sync {
    /// Records `deposit` at `index`. Re-inserting an identical deposit is a no-op.
    fn insert_deposit(
        &self,
        deposit: Deposit,
        block_number: u64,
        index: u64,
        deposit_root: Hash256,
    ) -> Result<(), Error>;

    /// Bulk-loads persisted containers. Containers that do not extend the cache are skipped.
    fn insert_deposit_containers(&self, containers: Vec<DepositContainer>);

    fn insert_pending_deposit(
        &self,
        deposit: Deposit,
        block_number: u64,
        index: u64,
        deposit_root: Hash256,
    );

    /// Records that every deposit up to and including `index` is finalized.
    fn insert_finalized_deposits(
        &self,
        index: u64,
        block_hash: Hash256,
        block_number: u64,
    ) -> Result<(), Error>;

    /// Drops pending deposits with an index below `merkle_tree_index`. Zero is a no-op.
    fn prune_pending_deposits(&self, merkle_tree_index: u64);

    /// Drops the proofs of deposits up to and including `until_deposit_index`.
    fn prune_proofs(&self, until_deposit_index: u64);

    fn all_deposit_containers(&self) -> Vec<DepositContainer>;

    /// Pending deposits observed at or before `until_block`, ordered by index.
    fn pending_deposits(&self, until_block: Option<u64>) -> Vec<Deposit>;

    fn finalized_deposits(&self) -> Option<FinalizedDeposits>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct CacheState {
    deposits: Vec<DepositContainer>,
    pending: Vec<DepositContainer>,
    finalized: Option<FinalizedDeposits>,
}

/// A `DepositCache` held entirely in memory.
#[derive(Default)]
pub struct InMemoryDepositCache {
    state: RwLock<CacheState>,
}

impl InMemoryDepositCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DepositCache for InMemoryDepositCache {
    fn insert_deposit(
        &self,
        deposit: Deposit,
        block_number: u64,
        index: u64,
        deposit_root: Hash256,
    ) -> Result<(), Error> {
        let mut state = self.state.write();
        let expected = state.deposits.len() as u64;
        match index {
            i if i == expected => {
                state.deposits.push(DepositContainer {
                    deposit,
                    execution_block_height: block_number,
                    deposit_root,
                    index,
                });
                Ok(())
            }
            i if i < expected => {
                // Proofs are dropped once finalized, so compare the data only.
                if state
                    .deposits
                    .get(i as usize)
                    .map_or(false, |known| known.deposit.data == deposit.data)
                {
                    Ok(())
                } else {
                    Err(Error::DuplicateDistinctDeposit { deposit_index: i })
                }
            }
            _ => Err(Error::NonConsecutive {
                deposit_index: index,
                expected,
            }),
        }
    }

    fn insert_deposit_containers(&self, mut containers: Vec<DepositContainer>) {
        containers.sort_by_key(|container| container.index);
        let mut state = self.state.write();
        for container in containers {
            if container.index == state.deposits.len() as u64 {
                state.deposits.push(container);
            }
        }
    }

    fn insert_pending_deposit(
        &self,
        deposit: Deposit,
        block_number: u64,
        index: u64,
        deposit_root: Hash256,
    ) {
        let mut state = self.state.write();
        if state.pending.iter().any(|pending| pending.index == index) {
            return;
        }
        state.pending.push(DepositContainer {
            deposit,
            execution_block_height: block_number,
            deposit_root,
            index,
        });
    }

    fn insert_finalized_deposits(
        &self,
        index: u64,
        block_hash: Hash256,
        block_number: u64,
    ) -> Result<(), Error> {
        let mut state = self.state.write();
        if state
            .finalized
            .map_or(false, |finalized| finalized.merkle_trie_index >= index)
        {
            return Ok(());
        }
        let deposit_root = state
            .deposits
            .get(index as usize)
            .map(|container| container.deposit_root)
            .ok_or(Error::UnknownDeposit {
                deposit_index: index,
                known_deposits: state.deposits.len() as u64,
            })?;
        state.finalized = Some(FinalizedDeposits {
            merkle_trie_index: index,
            deposit_root,
            block_hash,
            block_number,
        });
        Ok(())
    }

    fn prune_pending_deposits(&self, merkle_tree_index: u64) {
        if merkle_tree_index == 0 {
            return;
        }
        self.state
            .write()
            .pending
            .retain(|pending| pending.index >= merkle_tree_index);
    }

    fn prune_proofs(&self, until_deposit_index: u64) {
        let mut state = self.state.write();
        for container in state
            .deposits
            .iter_mut()
            .take_while(|container| container.index <= until_deposit_index)
        {
            container.deposit.proof = vec![];
        }
    }

    fn all_deposit_containers(&self) -> Vec<DepositContainer> {
        self.state.read().deposits.clone()
    }

    fn pending_deposits(&self, until_block: Option<u64>) -> Vec<Deposit> {
        let state = self.state.read();
        let mut pending = state
            .pending
            .iter()
            .filter(|pending| {
                until_block.map_or(true, |block| pending.execution_block_height <= block)
            })
            .collect::<Vec<_>>();
        pending.sort_by_key(|pending| pending.index);
        pending
            .into_iter()
            .map(|pending| pending.deposit.clone())
            .collect()
    }

    fn finalized_deposits(&self) -> Option<FinalizedDeposits> {
        self.state.read().finalized
    }

    fn len(&self) -> usize {
        self.state.read().deposits.len()
    }
}
