use super::{Error, KeyValueStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type DBHashMap = HashMap<Vec<u8>, Vec<u8>>;

/// A thread-safe `HashMap` wrapper. Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    db: Arc<RwLock<DBHashMap>>,
}

impl MemoryStore {
    /// Create a new, empty database.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }

    fn get_key_for_col(col: &str, key: &[u8]) -> Vec<u8> {
        let mut col = col.as_bytes().to_vec();
        col.extend_from_slice(key);
        col
    }
}

impl KeyValueStore for MemoryStore {
    fn get_bytes(&self, col: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let column_key = MemoryStore::get_key_for_col(col, key);
        Ok(self.db.read().get(&column_key).cloned())
    }

    fn put_bytes(&self, col: &str, key: &[u8], val: &[u8]) -> Result<(), Error> {
        let column_key = MemoryStore::get_key_for_col(col, key);
        self.db.write().insert(column_key, val.to_vec());
        Ok(())
    }

    fn key_exists(&self, col: &str, key: &[u8]) -> Result<bool, Error> {
        let column_key = MemoryStore::get_key_for_col(col, key);
        Ok(self.db.read().contains_key(&column_key))
    }

    fn key_delete(&self, col: &str, key: &[u8]) -> Result<(), Error> {
        let column_key = MemoryStore::get_key_for_col(col, key);
        self.db.write().remove(&column_key);
        Ok(())
    }
}
