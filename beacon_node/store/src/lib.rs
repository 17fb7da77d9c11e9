//! Storage functionality for the execution chain service.
//!
//! Provides the `MemoryStore`, an in-memory key-value store backed by a hash-map, and the
//! `BeaconStore` which layers typed access to beacon data on top of any `KeyValueStore`.
//!
//! Items are stored by serializing to bytes (SSZ) under a column-prefixed key. See tests for
//! implementation examples.
mod errors;
mod memory_store;

pub use self::memory_store::MemoryStore;
pub use errors::Error;

use ssz::{Decode, Encode};
use types::{BeaconState, Checkpoint, ExecutionChainData, Hash256};

// All the keys that get stored under the `BeaconMeta` column.
//
// We use `repeat_byte` because it's a const fn.
pub const EXECUTION_CHAIN_DATA_KEY: Hash256 = Hash256::repeat_byte(0);
pub const GENESIS_STATE_KEY: Hash256 = Hash256::repeat_byte(1);
pub const FINALIZED_CHECKPOINT_KEY: Hash256 = Hash256::repeat_byte(2);

/// A key-value database with support for columns.
///
/// A simple column implementation might involve prefixing a key with some bytes unique to each
/// column.
pub trait KeyValueStore: Sync + Send + Sized + 'static {
    /// Retrieve some bytes in `column` with `key`.
    fn get_bytes(&self, column: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Store some `value` in `column`, indexed with `key`.
    fn put_bytes(&self, column: &str, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Return `true` if `key` exists in `column`.
    fn key_exists(&self, column: &str, key: &[u8]) -> Result<bool, Error>;

    /// Removes `key` from `column`.
    fn key_delete(&self, column: &str, key: &[u8]) -> Result<(), Error>;

    /// Store an item in `Self`.
    fn put<I: StoreItem>(&self, key: &Hash256, item: &I) -> Result<(), Error> {
        let column = I::db_column().into();
        self.put_bytes(column, key.as_bytes(), &item.as_store_bytes())
    }

    /// Retrieve an item from `Self`.
    fn get<I: StoreItem>(&self, key: &Hash256) -> Result<Option<I>, Error> {
        let column = I::db_column().into();
        match self.get_bytes(column, key.as_bytes())? {
            Some(bytes) => Ok(Some(I::from_store_bytes(&bytes[..])?)),
            None => Ok(None),
        }
    }

    /// Returns `true` if the given key represents an item in `Self`.
    fn exists<I: StoreItem>(&self, key: &Hash256) -> Result<bool, Error> {
        self.key_exists(I::db_column().into(), key.as_bytes())
    }

    /// Remove an item from `Self`.
    fn delete<I: StoreItem>(&self, key: &Hash256) -> Result<(), Error> {
        self.key_delete(I::db_column().into(), key.as_bytes())
    }
}

/// A unique column identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DBColumn {
    /// For data related to the database itself.
    BeaconMeta,
    BeaconState,
    /// For the persisted execution chain snapshot.
    ExecutionChain,
}

impl From<DBColumn> for &'static str {
    /// Returns a `&str` that can be used for keying a key-value data base.
    fn from(col: DBColumn) -> &'static str {
        match col {
            DBColumn::BeaconMeta => "bma",
            DBColumn::BeaconState => "ste",
            DBColumn::ExecutionChain => "exc",
        }
    }
}

/// An item that may be stored in a `KeyValueStore` by serializing and deserializing from bytes.
pub trait StoreItem: Sized {
    /// Identifies which column this item should be placed in.
    fn db_column() -> DBColumn;

    /// Serialize `self` as bytes.
    fn as_store_bytes(&self) -> Vec<u8>;

    /// De-serialize `self` from bytes.
    fn from_store_bytes(bytes: &[u8]) -> Result<Self, Error>;
}

macro_rules! impl_ssz_store_item {
    ($type: ty, $column: expr) => {
        impl StoreItem for $type {
            fn db_column() -> DBColumn {
                $column
            }

            fn as_store_bytes(&self) -> Vec<u8> {
                self.as_ssz_bytes()
            }

            fn from_store_bytes(bytes: &[u8]) -> Result<Self, Error> {
                Self::from_ssz_bytes(bytes).map_err(Into::into)
            }
        }
    };
}

impl_ssz_store_item!(ExecutionChainData, DBColumn::ExecutionChain);
impl_ssz_store_item!(BeaconState, DBColumn::BeaconState);
impl_ssz_store_item!(Checkpoint, DBColumn::BeaconMeta);

/// The view of the beacon database required by the execution chain service.
pub trait BeaconDb: Send + Sync + 'static {
    /// Atomically replace the persisted execution chain snapshot.
    fn save_execution_chain_data(&self, data: &ExecutionChainData) -> Result<(), Error>;

    fn execution_chain_data(&self) -> Result<Option<ExecutionChainData>, Error>;

    fn genesis_state(&self) -> Result<Option<BeaconState>, Error>;

    fn finalized_checkpoint(&self) -> Result<Option<Checkpoint>, Error>;

    fn state_by_root(&self, root: &Hash256) -> Result<Option<BeaconState>, Error>;
}

/// Typed beacon data stored in some `KeyValueStore`.
#[derive(Clone, Default)]
pub struct BeaconStore<KV> {
    kv: KV,
}

impl<KV: KeyValueStore> BeaconStore<KV> {
    pub fn new(kv: KV) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &KV {
        &self.kv
    }

    pub fn put_genesis_state(&self, state: &BeaconState) -> Result<(), Error> {
        self.kv.put(&GENESIS_STATE_KEY, state)
    }

    pub fn put_finalized_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        self.kv.put(&FINALIZED_CHECKPOINT_KEY, checkpoint)
    }

    /// Store a state under its block root, as looked up via the finalized checkpoint.
    pub fn put_state(&self, root: &Hash256, state: &BeaconState) -> Result<(), Error> {
        self.kv.put(root, state)
    }
}

impl BeaconStore<MemoryStore> {
    /// A store with no backing disk, used for testing.
    pub fn open_ephemeral() -> Self {
        Self::new(MemoryStore::open())
    }
}

impl<KV: KeyValueStore> BeaconDb for BeaconStore<KV> {
    fn save_execution_chain_data(&self, data: &ExecutionChainData) -> Result<(), Error> {
        self.kv.put(&EXECUTION_CHAIN_DATA_KEY, data)
    }

    fn execution_chain_data(&self) -> Result<Option<ExecutionChainData>, Error> {
        self.kv.get(&EXECUTION_CHAIN_DATA_KEY)
    }

    fn genesis_state(&self) -> Result<Option<BeaconState>, Error> {
        self.kv.get(&GENESIS_STATE_KEY)
    }

    fn finalized_checkpoint(&self) -> Result<Option<Checkpoint>, Error> {
        self.kv.get(&FINALIZED_CHECKPOINT_KEY)
    }

    fn state_by_root(&self, root: &Hash256) -> Result<Option<BeaconState>, Error> {
        self.kv.get(root)
    }
}
