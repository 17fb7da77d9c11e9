use crate::{Hash256, PublicKeyBytes, SignatureBytes};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use tree_hash_derive::TreeHash;

/// The data supplied by the user to the deposit contract.
///
/// The leaf inserted into the deposit tree is `tree_hash_root(deposit_data)`.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Default, Serialize, Deserialize, Encode, Decode, TreeHash,
)]
pub struct DepositData {
    pub pubkey: PublicKeyBytes,
    pub withdrawal_credentials: Hash256,
    pub amount: u64,
    pub signature: SignatureBytes,
}

/// A deposit to potentially become a beacon chain validator.
///
/// `proof` holds `DEPOSIT_CONTRACT_TREE_DEPTH + 1` hashes while it is retained and is emptied once
/// the deposit is finalized.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Default, Serialize, Deserialize, Encode, Decode)]
pub struct Deposit {
    pub proof: Vec<Hash256>,
    pub data: DepositData,
}

/// A deposit as held by the deposit cache, together with where it was observed.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize, Encode, Decode)]
pub struct DepositContainer {
    pub deposit: Deposit,
    pub execution_block_height: u64,
    /// Deposit tree root immediately after this deposit was inserted.
    pub deposit_root: Hash256,
    pub index: u64,
}
