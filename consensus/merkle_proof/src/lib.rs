#[macro_use]
extern crate lazy_static;

use ethereum_hashing::hash32_concat;
use ethereum_types::H256;

const MAX_TREE_DEPTH: usize = 32;
const EMPTY_SLICE: &[H256] = &[];

lazy_static! {
    /// Cached zero hashes where `ZERO_HASHES[i]` is the hash of a Merkle tree with 2^i zero leaves.
    static ref ZERO_HASHES: Vec<H256> = {
        let mut hashes = vec![H256::zero(); MAX_TREE_DEPTH + 1];

        for i in 0..MAX_TREE_DEPTH {
            hashes[i + 1] = hash_concat(hashes[i], hashes[i]);
        }

        hashes
    };

    /// Zero nodes to act as "synthetic" left and right subtrees of other zero nodes.
    static ref ZERO_NODES: Vec<MerkleTree> = {
        (0..=MAX_TREE_DEPTH).map(MerkleTree::Zero).collect()
    };
}

/// Right-sparse Merkle tree.
///
/// Efficiently represents a Merkle tree of fixed depth where only the first N indices are
/// populated by non-zero leaves (perfect for the deposit contract tree).
///
/// Subtrees whose every leaf is final may be collapsed into a single `Finalized` hash. Such a
/// tree can still be appended to and still produces correct roots, but cannot produce proofs for
/// leaves inside the collapsed range.
#[derive(Debug, PartialEq, Clone)]
pub enum MerkleTree {
    /// Finalized node that contains the hash of its full subtree.
    Finalized(H256),
    /// Leaf node with the hash of its content.
    Leaf(H256),
    /// Internal node with hash, left subtree and right subtree.
    Node(H256, Box<Self>, Box<Self>),
    /// Zero subtree of a given depth.
    ///
    /// It represents a Merkle tree of 2^depth zero leaves.
    Zero(usize),
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum MerkleTreeError {
    // Trying to push in a leaf
    LeafReached,
    // No more space in the MerkleTree
    MerkleTreeFull,
    // MerkleTree is invalid
    Invalid,
    // Incorrect Depth provided
    DepthTooSmall,
    // Attempt to push onto a collapsed subtree
    FinalizedNodePushed,
    // Proof requested for a leaf inside a collapsed subtree
    ProofEncounteredFinalizedNode,
    // Snapshot branches do not agree with the deposit count
    InvalidSnapshot,
}

impl MerkleTree {
    /// Create a new Merkle tree from a list of leaves and a fixed depth.
    pub fn create(leaves: &[H256], depth: usize) -> Self {
        use MerkleTree::*;

        if leaves.is_empty() {
            return Zero(depth);
        }

        match depth {
            0 => {
                debug_assert_eq!(leaves.len(), 1);
                Leaf(leaves[0])
            }
            _ => {
                let subtree_capacity = 2usize.pow(depth as u32 - 1);
                let (left_leaves, right_leaves) = if leaves.len() <= subtree_capacity {
                    (leaves, EMPTY_SLICE)
                } else {
                    leaves.split_at(subtree_capacity)
                };

                let left_subtree = MerkleTree::create(left_leaves, depth - 1);
                let right_subtree = MerkleTree::create(right_leaves, depth - 1);
                let hash = hash_concat(left_subtree.hash(), right_subtree.hash());

                Node(hash, Box::new(left_subtree), Box::new(right_subtree))
            }
        }
    }

    /// Push an element in the MerkleTree.
    /// MerkleTree and depth must be correct, as the algorithm expects valid data.
    pub fn push_leaf(&mut self, elem: H256, depth: usize) -> Result<(), MerkleTreeError> {
        use MerkleTree::*;

        if depth == 0 {
            return Err(MerkleTreeError::DepthTooSmall);
        }

        match self {
            Leaf(_) => return Err(MerkleTreeError::LeafReached),
            Finalized(_) => return Err(MerkleTreeError::FinalizedNodePushed),
            Zero(_) => {
                *self = MerkleTree::create(&[elem], depth);
            }
            Node(ref mut hash, ref mut left, ref mut right) => {
                let left: &mut MerkleTree = &mut *left;
                let right: &mut MerkleTree = &mut *right;
                match (&*left, &*right) {
                    // Tree is full
                    (Leaf(_), Leaf(_)) | (Finalized(_), Leaf(_)) => {
                        return Err(MerkleTreeError::MerkleTreeFull)
                    }
                    // Left side is full, the right side takes the leaf
                    (Node(_, _, _), Node(_, _, _)) | (Finalized(_), Node(_, _, _)) => {
                        right.push_leaf(elem, depth - 1)?;
                    }
                    (Zero(_), Zero(_)) => {
                        *left = MerkleTree::create(&[elem], depth - 1);
                    }
                    (Leaf(_), Zero(_)) | (Finalized(_), Zero(_)) => {
                        *right = MerkleTree::create(&[elem], depth - 1);
                    }
                    (Node(_, _, _), Zero(_)) => match left.push_leaf(elem, depth - 1) {
                        Ok(_) => (),
                        Err(MerkleTreeError::MerkleTreeFull) => {
                            *right = MerkleTree::create(&[elem], depth - 1);
                        }
                        Err(e) => return Err(e),
                    },
                    (_, _) => return Err(MerkleTreeError::Invalid),
                }
                *hash = hash_concat(left.hash(), right.hash());
            }
        }

        Ok(())
    }

    /// Retrieve the root hash of this Merkle tree.
    pub fn hash(&self) -> H256 {
        match *self {
            MerkleTree::Finalized(h) => h,
            MerkleTree::Leaf(h) => h,
            MerkleTree::Node(h, _, _) => h,
            MerkleTree::Zero(depth) => ZERO_HASHES[depth],
        }
    }

    /// Get a reference to the left and right subtrees if they exist.
    pub fn left_and_right_branches(&self) -> Option<(&Self, &Self)> {
        match *self {
            MerkleTree::Finalized(_) | MerkleTree::Leaf(_) | MerkleTree::Zero(0) => None,
            MerkleTree::Node(_, ref l, ref r) => Some((l, r)),
            MerkleTree::Zero(depth) => Some((&ZERO_NODES[depth - 1], &ZERO_NODES[depth - 1])),
        }
    }

    /// Is this Merkle tree a leaf?
    pub fn is_leaf(&self) -> bool {
        matches!(self, MerkleTree::Leaf(_))
    }

    /// Collapse the subtrees covering the first `deposits_to_finalize` leaves into `Finalized`
    /// hashes. `level` is the height of `self`.
    ///
    /// Finalizing fewer leaves than are already finalized is a no-op.
    pub fn finalize_deposits(
        &mut self,
        deposits_to_finalize: usize,
        level: usize,
    ) -> Result<(), MerkleTreeError> {
        if deposits_to_finalize == 0 {
            return Ok(());
        }

        match self {
            MerkleTree::Finalized(_) => return Ok(()),
            MerkleTree::Zero(_) => return Err(MerkleTreeError::Invalid),
            MerkleTree::Leaf(hash) => {
                if level != 0 {
                    return Err(MerkleTreeError::Invalid);
                }
                *self = MerkleTree::Finalized(*hash);
            }
            MerkleTree::Node(hash, left, right) => {
                if level == 0 {
                    return Err(MerkleTreeError::Invalid);
                }
                let deposits = 0x1 << level;
                if deposits <= deposits_to_finalize {
                    *self = MerkleTree::Finalized(*hash);
                    return Ok(());
                }
                let half = deposits / 2;
                left.finalize_deposits(deposits_to_finalize.min(half), level - 1)?;
                if deposits_to_finalize > half {
                    right.finalize_deposits(deposits_to_finalize - half, level - 1)?;
                }
            }
        }
        Ok(())
    }

    /// Appends the finalized subtree roots to `result`, left to right.
    pub fn append_finalized_hashes(&self, result: &mut Vec<H256>) {
        match self {
            MerkleTree::Zero(_) | MerkleTree::Leaf(_) => {}
            MerkleTree::Finalized(h) => result.push(*h),
            MerkleTree::Node(_, left, right) => {
                left.append_finalized_hashes(result);
                right.append_finalized_hashes(result);
            }
        }
    }

    pub fn get_finalized_hashes(&self) -> Vec<H256> {
        let mut result = vec![];
        self.append_finalized_hashes(&mut result);
        result
    }

    /// Rebuild a tree of height `level` holding `deposit_count` finalized leaves, given only the
    /// roots of its maximal finalized subtrees.
    pub fn from_finalized_snapshot(
        finalized_branch: &[H256],
        deposit_count: usize,
        level: usize,
    ) -> Result<Self, MerkleTreeError> {
        if finalized_branch.is_empty() {
            return if deposit_count == 0 {
                Ok(Self::create(&[], level))
            } else {
                Err(MerkleTreeError::InvalidSnapshot)
            };
        }
        if deposit_count == (0x1 << level) {
            return finalized_branch
                .first()
                .map(|h| MerkleTree::Finalized(*h))
                .ok_or(MerkleTreeError::InvalidSnapshot);
        }
        if level == 0 {
            return Err(MerkleTreeError::InvalidSnapshot);
        }

        let (left, right) = match deposit_count.checked_sub(0x1 << (level - 1)) {
            // left subtree is fully finalized
            Some(right_deposits) => {
                let (left_hash, right_branch) = finalized_branch
                    .split_first()
                    .ok_or(MerkleTreeError::InvalidSnapshot)?;
                (
                    MerkleTree::Finalized(*left_hash),
                    MerkleTree::from_finalized_snapshot(right_branch, right_deposits, level - 1)?,
                )
            }
            None => (
                MerkleTree::from_finalized_snapshot(finalized_branch, deposit_count, level - 1)?,
                MerkleTree::create(&[], level - 1),
            ),
        };
        let hash = hash_concat(left.hash(), right.hash());
        Ok(MerkleTree::Node(hash, Box::new(left), Box::new(right)))
    }

    /// Return the leaf at `index` and a Merkle proof of its inclusion.
    ///
    /// The Merkle proof is in "bottom-up" order, starting with a leaf node
    /// and moving up the tree. Its length will be exactly equal to `depth`.
    pub fn generate_proof(
        &self,
        index: usize,
        depth: usize,
    ) -> Result<(H256, Vec<H256>), MerkleTreeError> {
        let mut proof = vec![];
        let mut current_node = self;
        let mut current_depth = depth;
        while current_depth > 0 {
            let ith_bit = (index >> (current_depth - 1)) & 0x01;
            if let MerkleTree::Finalized(_) = current_node {
                return Err(MerkleTreeError::ProofEncounteredFinalizedNode);
            }
            let (left, right) = current_node
                .left_and_right_branches()
                .ok_or(MerkleTreeError::Invalid)?;

            // Go right, include the left branch in the proof.
            if ith_bit == 1 {
                proof.push(left.hash());
                current_node = right;
            } else {
                proof.push(right.hash());
                current_node = left;
            }
            current_depth -= 1;
        }

        if let MerkleTree::Finalized(_) = current_node {
            return Err(MerkleTreeError::ProofEncounteredFinalizedNode);
        }

        debug_assert_eq!(proof.len(), depth);

        // Put proof in bottom-up order.
        proof.reverse();

        Ok((current_node.hash(), proof))
    }
}

/// Verify a proof that `leaf` exists at `index` in a Merkle tree rooted at `root`.
///
/// The `branch` argument is the main component of the proof: it should be a list of internal
/// node hashes such that the root can be reconstructed (in bottom-up order).
pub fn verify_merkle_proof(
    leaf: H256,
    branch: &[H256],
    depth: usize,
    index: usize,
    root: H256,
) -> bool {
    if branch.len() == depth {
        merkle_root_from_branch(leaf, branch, depth, index) == root
    } else {
        false
    }
}

/// Compute a root hash from a leaf and a Merkle proof.
pub fn merkle_root_from_branch(leaf: H256, branch: &[H256], depth: usize, index: usize) -> H256 {
    branch
        .iter()
        .enumerate()
        .take(depth)
        .fold(leaf, |node, (i, sibling)| {
            if (index >> i) & 0x01 == 1 {
                hash_concat(*sibling, node)
            } else {
                hash_concat(node, *sibling)
            }
        })
}

/// Compute the hash of two other hashes concatenated.
pub fn hash_concat(h1: H256, h2: H256) -> H256 {
    H256::from(hash32_concat(h1.as_bytes(), h2.as_bytes()))
}
