//! Applies deposits to the pre-genesis beacon state and decides when the beacon chain may start.

use merkle_proof::verify_merkle_proof;
use std::collections::HashMap;
use tree_hash::TreeHash;
use types::{
    beacon_state::Error as BeaconStateError, BeaconState, ChainSpec, Deposit, Hash256,
    PublicKeyBytes, Validator, DEPOSIT_CONTRACT_TREE_DEPTH, FAR_FUTURE_EPOCH, GENESIS_EPOCH,
};

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// The deposit proof does not lead to the given deposit root.
    BadMerkleProof { deposit_index: u64 },
    BeaconState(BeaconStateError),
}

impl From<BeaconStateError> for Error {
    fn from(e: BeaconStateError) -> Self {
        Error::BeaconState(e)
    }
}

/// The beacon state as it is built up from deposits before genesis, with a pubkey index.
#[derive(Debug, Clone, Default)]
pub struct PreGenesisState {
    state: BeaconState,
    pubkey_cache: HashMap<PublicKeyBytes, usize>,
}

impl PreGenesisState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: BeaconState) -> Self {
        let pubkey_cache = state
            .validators
            .iter()
            .enumerate()
            .map(|(i, validator)| (validator.pubkey.clone(), i))
            .collect();
        Self {
            state,
            pubkey_cache,
        }
    }

    pub fn state(&self) -> &BeaconState {
        &self.state
    }

    pub fn num_validators(&self) -> usize {
        self.state.validators.len()
    }

    pub fn active_validator_count(&self) -> usize {
        self.state.active_validator_count(GENESIS_EPOCH)
    }

    /// Applies `deposit` as the next deposit, against `deposit_root`.
    ///
    /// The deposit index is advanced even if the proof is rejected, so the state stays aligned
    /// with the deposit contract. Signatures are not checked.
    pub fn process_deposit(
        &mut self,
        deposit: &Deposit,
        deposit_root: Hash256,
        deposit_count: u64,
        block_hash: Hash256,
        spec: &ChainSpec,
    ) -> Result<(), Error> {
        let deposit_index = self.state.execution_deposit_index;
        self.state.execution_deposit_index += 1;
        self.state.execution_data.deposit_root = deposit_root;
        self.state.execution_data.deposit_count = deposit_count;
        self.state.execution_data.block_hash = block_hash;

        let leaf = deposit.data.tree_hash_root();
        if !verify_merkle_proof(
            leaf,
            &deposit.proof,
            DEPOSIT_CONTRACT_TREE_DEPTH + 1,
            deposit_index as usize,
            deposit_root,
        ) {
            return Err(Error::BadMerkleProof { deposit_index });
        }

        let amount = deposit.data.amount;
        match self.pubkey_cache.get(&deposit.data.pubkey) {
            Some(&index) => {
                let balance = self.state.get_balance_mut(index)?;
                *balance = balance.saturating_add(amount);
                let balance = *balance;
                let validator = self.state.get_validator_mut(index)?;
                validator.effective_balance = effective_balance(balance, spec);
                if validator.effective_balance == spec.max_effective_balance {
                    validator.activation_eligibility_epoch = GENESIS_EPOCH;
                    validator.activation_epoch = GENESIS_EPOCH;
                }
            }
            None => {
                let effective_balance = effective_balance(amount, spec);
                let activation_epoch = if effective_balance == spec.max_effective_balance {
                    GENESIS_EPOCH
                } else {
                    FAR_FUTURE_EPOCH
                };
                self.pubkey_cache
                    .insert(deposit.data.pubkey.clone(), self.state.validators.len());
                self.state.validators.push(Validator {
                    pubkey: deposit.data.pubkey.clone(),
                    withdrawal_credentials: deposit.data.withdrawal_credentials,
                    effective_balance,
                    activation_eligibility_epoch: activation_epoch,
                    activation_epoch,
                });
                self.state.balances.push(amount);
            }
        }

        Ok(())
    }
}

/// `min(balance - balance % increment, max_effective_balance)`
pub fn effective_balance(balance: u64, spec: &ChainSpec) -> u64 {
    let increment = spec.effective_balance_increment.max(1);
    std::cmp::min(balance - balance % increment, spec.max_effective_balance)
}

/// The genesis time that would result from starting on an execution block at `block_time`.
pub fn genesis_time(block_time: u64, spec: &ChainSpec) -> u64 {
    block_time.saturating_add(spec.genesis_delay)
}

pub fn is_valid_genesis_state(
    active_validator_count: usize,
    genesis_time: u64,
    spec: &ChainSpec,
) -> bool {
    active_validator_count as u64 >= spec.min_genesis_active_validator_count
        && genesis_time >= spec.min_genesis_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposit_tree::{DepositAccumulator, SparseDepositTrie};
    use types::{DepositData, SignatureBytes, PUBLIC_KEY_BYTES_LEN};

    fn deposit_data(key: u8, amount: u64) -> DepositData {
        DepositData {
            pubkey: PublicKeyBytes::from_bytes(&[key; PUBLIC_KEY_BYTES_LEN]).unwrap(),
            withdrawal_credentials: Hash256::repeat_byte(key),
            amount,
            signature: SignatureBytes::empty(),
        }
    }

    /// Inserts `data` into `tree` and applies it to `state` with a fresh proof.
    fn apply(
        tree: &mut SparseDepositTrie,
        state: &mut PreGenesisState,
        data: DepositData,
        spec: &ChainSpec,
    ) -> Result<(), Error> {
        let index = tree.num_of_items();
        tree.insert(data.tree_hash_root(), index).unwrap();
        let deposit = Deposit {
            proof: tree.merkle_proof(index).unwrap(),
            data,
        };
        state.process_deposit(
            &deposit,
            tree.hash_tree_root(),
            tree.num_of_items(),
            Hash256::zero(),
            spec,
        )
    }

    #[test]
    fn full_deposit_activates() {
        let spec = ChainSpec::minimal();
        let mut tree = SparseDepositTrie::new();
        let mut state = PreGenesisState::new();

        apply(&mut tree, &mut state, deposit_data(1, spec.max_effective_balance), &spec).unwrap();
        assert_eq!(state.num_validators(), 1);
        assert_eq!(state.active_validator_count(), 1);
        assert_eq!(state.state().execution_deposit_index, 1);
    }

    #[test]
    fn top_up_activates() {
        let spec = ChainSpec::minimal();
        let mut tree = SparseDepositTrie::new();
        let mut state = PreGenesisState::new();

        let half = spec.max_effective_balance / 2;
        apply(&mut tree, &mut state, deposit_data(1, half), &spec).unwrap();
        assert_eq!(state.active_validator_count(), 0);
        assert_eq!(state.state().validators[0].activation_epoch, FAR_FUTURE_EPOCH);

        apply(&mut tree, &mut state, deposit_data(1, half + 1), &spec).unwrap();
        assert_eq!(state.num_validators(), 1);
        assert_eq!(state.active_validator_count(), 1);
        assert_eq!(state.state().balances[0], spec.max_effective_balance + 1);
    }

    #[test]
    fn bad_proof_is_rejected_but_counted() {
        let spec = ChainSpec::minimal();
        let mut state = PreGenesisState::new();
        let deposit = Deposit {
            proof: vec![Hash256::zero(); DEPOSIT_CONTRACT_TREE_DEPTH + 1],
            data: deposit_data(1, spec.max_effective_balance),
        };
        assert_eq!(
            state.process_deposit(&deposit, Hash256::repeat_byte(1), 1, Hash256::zero(), &spec),
            Err(Error::BadMerkleProof { deposit_index: 0 })
        );
        assert_eq!(state.num_validators(), 0);
        assert_eq!(state.state().execution_deposit_index, 1);
    }

    #[test]
    fn pubkey_cache_survives_restore() {
        let spec = ChainSpec::minimal();
        let mut tree = SparseDepositTrie::new();
        let mut state = PreGenesisState::new();
        apply(&mut tree, &mut state, deposit_data(3, 1_000_000_000), &spec).unwrap();

        let mut restored = PreGenesisState::from_state(state.state().clone());
        apply(&mut tree, &mut restored, deposit_data(3, 1_000_000_000), &spec).unwrap();
        assert_eq!(restored.num_validators(), 1);
        assert_eq!(restored.state().validators[0].effective_balance, 2_000_000_000);
    }

    #[test]
    fn effective_balance_rounding() {
        let spec = ChainSpec::mainnet();
        assert_eq!(effective_balance(1_500_000_000, &spec), 1_000_000_000);
        assert_eq!(effective_balance(40_000_000_000, &spec), spec.max_effective_balance);
    }

    #[test]
    fn genesis_conditions() {
        let spec = ChainSpec::minimal();
        let count = spec.min_genesis_active_validator_count as usize;
        let time = spec.min_genesis_time;
        assert!(is_valid_genesis_state(count, time, &spec));
        assert!(!is_valid_genesis_state(count - 1, time, &spec));
        assert!(!is_valid_genesis_state(count, time - 1, &spec));
        assert_eq!(genesis_time(100, &spec), 100 + spec.genesis_delay);
    }
}
