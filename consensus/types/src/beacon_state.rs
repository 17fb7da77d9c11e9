use crate::{Epoch, ExecutionData, Hash256, PublicKeyBytes, Slot};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};

pub const GENESIS_EPOCH: Epoch = 0;
pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    UnknownValidator(usize),
    BalancesOutOfBounds(usize),
}

/// Information about a validator, reduced to the fields touched by deposit processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Validator {
    pub pubkey: PublicKeyBytes,
    pub withdrawal_credentials: Hash256,
    pub effective_balance: u64,
    pub activation_eligibility_epoch: Epoch,
    pub activation_epoch: Epoch,
}

impl Validator {
    pub fn is_active_at(&self, epoch: Epoch) -> bool {
        self.activation_epoch <= epoch
    }
}

/// The subset of the beacon state that the execution chain service reads and, before genesis,
/// writes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct BeaconState {
    pub genesis_time: u64,
    pub slot: Slot,
    pub execution_data: ExecutionData,
    /// Index of the next deposit the beacon chain expects to process.
    pub execution_deposit_index: u64,
    pub validators: Vec<Validator>,
    pub balances: Vec<u64>,
}

impl BeaconState {
    pub fn new(genesis_time: u64, execution_data: ExecutionData) -> Self {
        Self {
            genesis_time,
            execution_data,
            ..Self::default()
        }
    }

    pub fn get_validator_index(&self, pubkey: &PublicKeyBytes) -> Option<usize> {
        self.validators.iter().position(|v| &v.pubkey == pubkey)
    }

    pub fn get_balance_mut(&mut self, index: usize) -> Result<&mut u64, Error> {
        self.balances
            .get_mut(index)
            .ok_or(Error::BalancesOutOfBounds(index))
    }

    pub fn get_validator_mut(&mut self, index: usize) -> Result<&mut Validator, Error> {
        self.validators
            .get_mut(index)
            .ok_or(Error::UnknownValidator(index))
    }

    pub fn active_validator_count(&self, epoch: Epoch) -> usize {
        self.validators
            .iter()
            .filter(|v| v.is_active_at(epoch))
            .count()
    }
}
