use super::Hash256;

use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use tree_hash_derive::TreeHash;

/// Contains data obtained from the execution chain, as voted upon by the beacon chain.
#[derive(
    Debug, PartialEq, Clone, Default, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash,
)]
pub struct ExecutionData {
    pub deposit_root: Hash256,
    pub deposit_count: u64,
    pub block_hash: Hash256,
}

/// The most recent execution head observed by the node, plus the highest block that has been
/// scanned for deposit logs.
#[derive(Debug, PartialEq, Clone, Default, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LatestExecutionData {
    pub block_height: u64,
    pub block_time: u64,
    pub block_hash: Hash256,
    pub last_requested_block: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode, Encode};
    use tree_hash::TreeHash;

    #[test]
    fn execution_data_ssz_layout() {
        let data = ExecutionData {
            deposit_root: Hash256::repeat_byte(1),
            deposit_count: 7,
            block_hash: Hash256::repeat_byte(2),
        };
        let bytes = data.as_ssz_bytes();
        assert_eq!(bytes.len(), 32 + 8 + 32);
        assert_eq!(&bytes[32..40], &7u64.to_le_bytes());
        assert_eq!(ExecutionData::from_ssz_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn tree_hash_changes_with_count() {
        let a = ExecutionData::default();
        let b = ExecutionData {
            deposit_count: 1,
            ..ExecutionData::default()
        };
        assert_ne!(a.tree_hash_root(), b.tree_hash_root());
    }
}
