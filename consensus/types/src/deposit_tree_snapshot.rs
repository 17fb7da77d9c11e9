use crate::{Hash256, DEPOSIT_CONTRACT_TREE_DEPTH};
use ethereum_hashing::{hash32_concat, ZERO_HASHES};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};

/// The finalized portion of the deposit tree, as described by EIP-4881.
///
/// `finalized` holds the roots of the maximal finalized subtrees ordered left to right.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct DepositTreeSnapshot {
    pub finalized: Vec<Hash256>,
    pub deposit_root: Hash256,
    pub deposit_count: u64,
    pub execution_block_hash: Hash256,
    pub execution_block_height: u64,
}

impl DepositTreeSnapshot {
    /// Recomputes the deposit root (with the length mixed in) from the finalized branches.
    ///
    /// Returns `None` if `finalized` is inconsistent with `deposit_count`.
    pub fn calculate_root(&self) -> Option<Hash256> {
        let mut size = self.deposit_count;
        let mut index = self.finalized.len();
        let mut root = [0; 32];
        for height in 0..DEPOSIT_CONTRACT_TREE_DEPTH {
            root = if size & 1 == 1 {
                index = index.checked_sub(1)?;
                hash32_concat(self.finalized.get(index)?.as_bytes(), &root)
            } else {
                hash32_concat(&root, ZERO_HASHES.get(height)?)
            };
            size /= 2;
        }
        let mut length = [0; 32];
        length[..8].copy_from_slice(&self.deposit_count.to_le_bytes());
        Some(Hash256::from_slice(&hash32_concat(&root, &length)))
    }

    pub fn is_valid(&self) -> bool {
        self.calculate_root() == Some(self.deposit_root)
    }
}

/// The legacy, non-finalizing representation of the deposit tree: every leaf is retained.
///
/// `deposit_root` is the root (with the length mixed in) the tree had when it was written, so a
/// record whose leaves were damaged can be detected on load.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq, Default)]
pub struct SparseTrieRecord {
    pub depth: u64,
    pub leaves: Vec<Hash256>,
    pub deposit_root: Hash256,
}

/// The block at which a prefix of the deposit tree was finalized.
#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FinalizedExecutionBlock {
    pub deposit_root: Hash256,
    pub deposit_count: u64,
    pub block_hash: Hash256,
    pub block_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_empty_root() {
        let mut expected = Hash256::zero();
        let mut node = [0; 32];
        for height in 0..DEPOSIT_CONTRACT_TREE_DEPTH {
            node = hash32_concat(&node, &ZERO_HASHES[height]);
        }
        expected.assign_from_slice(&hash32_concat(&node, &[0; 32]));

        let snapshot = DepositTreeSnapshot {
            deposit_root: expected,
            ..DepositTreeSnapshot::default()
        };
        assert!(snapshot.is_valid());
    }

    #[test]
    fn missing_branch_is_invalid() {
        let snapshot = DepositTreeSnapshot {
            deposit_count: 1,
            ..DepositTreeSnapshot::default()
        };
        assert_eq!(snapshot.calculate_root(), None);
    }
}
