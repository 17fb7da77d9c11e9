//! Incremental Merkle accumulators over deposit leaves.
//!
//! Two backends exist:
//!
//! - `SparseDepositTrie`: the legacy representation which retains every leaf forever.
//! - `SnapshotDepositTree`: an EIP-4881 tree which collapses finalized subtrees and persists only
//!   the finalized branch roots.
//!
//! Both produce identical roots and proofs for any sequence of inserts.

use merkle_proof::{hash_concat, MerkleTree, MerkleTreeError};
use serde::{Deserialize, Serialize};
use types::{
    DepositTreeSnapshot, FinalizedExecutionBlock, Hash256, SparseTrieRecord,
    DEPOSIT_CONTRACT_TREE_DEPTH,
};

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// Leaves must be inserted at exactly `num_of_items()`.
    NonConsecutiveInsert { index: u64, expected: u64 },
    /// A proof was requested for a leaf that is not in the tree.
    UnknownLeaf { index: u64, num_of_items: u64 },
    /// Attempted to finalize a leaf that has not been inserted.
    FinalizeBeyondTree { index: u64, num_of_items: u64 },
    /// A persisted record does not describe a valid tree.
    InvalidSnapshot(String),
    /// Migrating the legacy trie produced a different root.
    RootMismatch { legacy: Hash256, migrated: Hash256 },
    /// A record of one kind was handed to a constructor of the other.
    WrongTreeKind { expected: DepositTreeKind },
    MerkleTree(MerkleTreeError),
}

impl From<MerkleTreeError> for Error {
    fn from(e: MerkleTreeError) -> Self {
        Error::MerkleTree(e)
    }
}

/// Selects which accumulator backend the service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositTreeKind {
    Sparse,
    Snapshot,
}

impl Default for DepositTreeKind {
    fn default() -> Self {
        DepositTreeKind::Snapshot
    }
}

/// The persisted form of an accumulator.
#[derive(Debug, PartialEq, Clone)]
pub enum DepositTreeRecord {
    SparseTrie(SparseTrieRecord),
    Snapshot(DepositTreeSnapshot),
}

/// An append-only Merkle accumulator of deposit leaves with the deposit count mixed into its root.
pub trait DepositAccumulator: Send + Sync {
    fn kind(&self) -> DepositTreeKind;

    /// Appends `leaf`, which must be the `index`th leaf.
    fn insert(&mut self, leaf: Hash256, index: u64) -> Result<(), Error>;

    fn num_of_items(&self) -> u64;

    /// The root of the tree with the item count mixed in.
    fn hash_tree_root(&self) -> Hash256;

    /// A proof of `DEPOSIT_CONTRACT_TREE_DEPTH + 1` hashes for the leaf at `index` against
    /// `hash_tree_root()`. The final element is the little-endian item count.
    fn merkle_proof(&self, index: u64) -> Result<Vec<Hash256>, Error>;

    /// Marks every leaf up to and including `index` as final. No-op where unsupported or where
    /// a later index is already finalized.
    fn finalize(
        &mut self,
        index: u64,
        block_hash: Hash256,
        block_height: u64,
    ) -> Result<(), Error>;

    fn to_record(&self) -> DepositTreeRecord;
}

/// Returns an empty accumulator of `kind`.
pub fn new_deposit_tree(kind: DepositTreeKind) -> Box<dyn DepositAccumulator> {
    match kind {
        DepositTreeKind::Sparse => Box::new(SparseDepositTrie::new()),
        DepositTreeKind::Snapshot => Box::new(SnapshotDepositTree::new()),
    }
}

/// Restores an accumulator of `kind` from `record`.
///
/// A sparse record presented for a snapshot tree is migrated. The reverse is an error since the
/// leaves of a snapshot cannot be recovered.
pub fn deposit_tree_from_record(
    kind: DepositTreeKind,
    record: DepositTreeRecord,
) -> Result<Box<dyn DepositAccumulator>, Error> {
    match (kind, record) {
        (DepositTreeKind::Sparse, DepositTreeRecord::SparseTrie(record)) => {
            Ok(Box::new(SparseDepositTrie::from_record(&record)?))
        }
        (DepositTreeKind::Sparse, DepositTreeRecord::Snapshot(_)) => Err(Error::WrongTreeKind {
            expected: DepositTreeKind::Sparse,
        }),
        (DepositTreeKind::Snapshot, DepositTreeRecord::Snapshot(snapshot)) => {
            Ok(Box::new(SnapshotDepositTree::from_snapshot(&snapshot)?))
        }
        (DepositTreeKind::Snapshot, DepositTreeRecord::SparseTrie(record)) => {
            Ok(Box::new(migrate_legacy(&record)?))
        }
    }
}

/// Replays every leaf of a legacy record into a fresh snapshot tree and checks the result against
/// the root the record was written with.
pub fn migrate_legacy(record: &SparseTrieRecord) -> Result<SnapshotDepositTree, Error> {
    check_depth(record.depth)?;
    let mut migrated = SnapshotDepositTree::new();
    for (index, leaf) in record.leaves.iter().enumerate() {
        migrated.insert(*leaf, index as u64)?;
    }

    let migrated_root = migrated.hash_tree_root();
    if migrated_root != record.deposit_root {
        return Err(Error::RootMismatch {
            legacy: record.deposit_root,
            migrated: migrated_root,
        });
    }
    Ok(migrated)
}

fn check_depth(depth: u64) -> Result<(), Error> {
    if depth != DEPOSIT_CONTRACT_TREE_DEPTH as u64 {
        return Err(Error::InvalidSnapshot(format!(
            "Sparse trie depth {} != {}",
            depth, DEPOSIT_CONTRACT_TREE_DEPTH
        )));
    }
    Ok(())
}

fn mix_in_length(root: Hash256, count: u64) -> Hash256 {
    hash_concat(root, length_chunk(count))
}

fn length_chunk(count: u64) -> Hash256 {
    let mut length = Hash256::zero();
    length.as_bytes_mut()[..8].copy_from_slice(&count.to_le_bytes());
    length
}

fn check_insert_index(index: u64, num_of_items: u64) -> Result<(), Error> {
    if index != num_of_items {
        return Err(Error::NonConsecutiveInsert {
            index,
            expected: num_of_items,
        });
    }
    Ok(())
}

fn proof_with_length(
    tree: &MerkleTree,
    index: u64,
    num_of_items: u64,
) -> Result<Vec<Hash256>, Error> {
    if index >= num_of_items {
        return Err(Error::UnknownLeaf {
            index,
            num_of_items,
        });
    }
    let (_, mut proof) = tree.generate_proof(index as usize, DEPOSIT_CONTRACT_TREE_DEPTH)?;
    proof.push(length_chunk(num_of_items));
    Ok(proof)
}

/// The legacy accumulator. Never forgets a leaf, so can prove any of them.
#[derive(Debug, Clone)]
pub struct SparseDepositTrie {
    tree: MerkleTree,
    leaves: Vec<Hash256>,
}

impl SparseDepositTrie {
    pub fn new() -> Self {
        Self {
            tree: MerkleTree::create(&[], DEPOSIT_CONTRACT_TREE_DEPTH),
            leaves: vec![],
        }
    }

    pub fn from_record(record: &SparseTrieRecord) -> Result<Self, Error> {
        check_depth(record.depth)?;
        let trie = Self {
            tree: MerkleTree::create(&record.leaves, DEPOSIT_CONTRACT_TREE_DEPTH),
            leaves: record.leaves.clone(),
        };
        if trie.hash_tree_root() != record.deposit_root {
            return Err(Error::InvalidSnapshot(format!(
                "Sparse trie root {:?} does not match its leaves",
                record.deposit_root
            )));
        }
        Ok(trie)
    }

    pub fn leaves(&self) -> &[Hash256] {
        &self.leaves
    }
}

impl Default for SparseDepositTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl DepositAccumulator for SparseDepositTrie {
    fn kind(&self) -> DepositTreeKind {
        DepositTreeKind::Sparse
    }

    fn insert(&mut self, leaf: Hash256, index: u64) -> Result<(), Error> {
        check_insert_index(index, self.num_of_items())?;
        self.tree.push_leaf(leaf, DEPOSIT_CONTRACT_TREE_DEPTH)?;
        self.leaves.push(leaf);
        Ok(())
    }

    fn num_of_items(&self) -> u64 {
        self.leaves.len() as u64
    }

    fn hash_tree_root(&self) -> Hash256 {
        mix_in_length(self.tree.hash(), self.num_of_items())
    }

    fn merkle_proof(&self, index: u64) -> Result<Vec<Hash256>, Error> {
        proof_with_length(&self.tree, index, self.num_of_items())
    }

    fn finalize(&mut self, _: u64, _: Hash256, _: u64) -> Result<(), Error> {
        Ok(())
    }

    fn to_record(&self) -> DepositTreeRecord {
        DepositTreeRecord::SparseTrie(SparseTrieRecord {
            depth: DEPOSIT_CONTRACT_TREE_DEPTH as u64,
            leaves: self.leaves.clone(),
            deposit_root: self.hash_tree_root(),
        })
    }
}

/// An EIP-4881 deposit tree.
///
/// Leaves below the finalized index are collapsed and can no longer be proven.
#[derive(Debug, Clone)]
pub struct SnapshotDepositTree {
    tree: MerkleTree,
    count: u64,
    finalized_execution_block: Option<FinalizedExecutionBlock>,
}

impl SnapshotDepositTree {
    pub fn new() -> Self {
        Self {
            tree: MerkleTree::create(&[], DEPOSIT_CONTRACT_TREE_DEPTH),
            count: 0,
            finalized_execution_block: None,
        }
    }

    pub fn from_snapshot(snapshot: &DepositTreeSnapshot) -> Result<Self, Error> {
        if !snapshot.is_valid() {
            return Err(Error::InvalidSnapshot(format!(
                "Snapshot root {:?} does not match its branches",
                snapshot.deposit_root
            )));
        }
        let tree = MerkleTree::from_finalized_snapshot(
            &snapshot.finalized,
            snapshot.deposit_count as usize,
            DEPOSIT_CONTRACT_TREE_DEPTH,
        )?;
        let finalized_execution_block = (snapshot.deposit_count > 0).then(|| {
            FinalizedExecutionBlock {
                deposit_root: snapshot.deposit_root,
                deposit_count: snapshot.deposit_count,
                block_hash: snapshot.execution_block_hash,
                block_height: snapshot.execution_block_height,
            }
        });
        Ok(Self {
            tree,
            count: snapshot.deposit_count,
            finalized_execution_block,
        })
    }

    pub fn finalized_execution_block(&self) -> Option<FinalizedExecutionBlock> {
        self.finalized_execution_block
    }

    /// The EIP-4881 snapshot of the finalized portion of the tree.
    pub fn snapshot(&self) -> DepositTreeSnapshot {
        match self.finalized_execution_block {
            Some(finalized) => DepositTreeSnapshot {
                finalized: self.tree.get_finalized_hashes(),
                deposit_root: finalized.deposit_root,
                deposit_count: finalized.deposit_count,
                execution_block_hash: finalized.block_hash,
                execution_block_height: finalized.block_height,
            },
            None => DepositTreeSnapshot {
                finalized: vec![],
                deposit_root: mix_in_length(
                    MerkleTree::create(&[], DEPOSIT_CONTRACT_TREE_DEPTH).hash(),
                    0,
                ),
                deposit_count: 0,
                execution_block_hash: Hash256::zero(),
                execution_block_height: 0,
            },
        }
    }
}

impl Default for SnapshotDepositTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DepositAccumulator for SnapshotDepositTree {
    fn kind(&self) -> DepositTreeKind {
        DepositTreeKind::Snapshot
    }

    fn insert(&mut self, leaf: Hash256, index: u64) -> Result<(), Error> {
        check_insert_index(index, self.count)?;
        self.tree.push_leaf(leaf, DEPOSIT_CONTRACT_TREE_DEPTH)?;
        self.count += 1;
        Ok(())
    }

    fn num_of_items(&self) -> u64 {
        self.count
    }

    fn hash_tree_root(&self) -> Hash256 {
        mix_in_length(self.tree.hash(), self.count)
    }

    fn merkle_proof(&self, index: u64) -> Result<Vec<Hash256>, Error> {
        proof_with_length(&self.tree, index, self.count)
    }

    fn finalize(
        &mut self,
        index: u64,
        block_hash: Hash256,
        block_height: u64,
    ) -> Result<(), Error> {
        let deposit_count = index.saturating_add(1);
        if deposit_count > self.count {
            return Err(Error::FinalizeBeyondTree {
                index,
                num_of_items: self.count,
            });
        }
        if self
            .finalized_execution_block
            .map_or(false, |finalized| finalized.deposit_count >= deposit_count)
        {
            return Ok(());
        }

        self.tree
            .finalize_deposits(deposit_count as usize, DEPOSIT_CONTRACT_TREE_DEPTH)?;

        let finalized_prefix = DepositTreeSnapshot {
            finalized: self.tree.get_finalized_hashes(),
            deposit_count,
            ..DepositTreeSnapshot::default()
        };
        let deposit_root = finalized_prefix.calculate_root().ok_or_else(|| {
            Error::InvalidSnapshot(format!(
                "Finalized branches do not cover {} deposits",
                deposit_count
            ))
        })?;

        self.finalized_execution_block = Some(FinalizedExecutionBlock {
            deposit_root,
            deposit_count,
            block_hash,
            block_height,
        });
        Ok(())
    }

    fn to_record(&self) -> DepositTreeRecord {
        DepositTreeRecord::Snapshot(self.snapshot())
    }
}
