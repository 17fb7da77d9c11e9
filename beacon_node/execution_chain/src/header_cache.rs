use crate::rpc::BlockHeader;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use types::Hash256;

pub const DEFAULT_HEADER_CACHE_SIZE: usize = 2_000;

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// A header with a zero hash cannot be indexed.
    ZeroHash { block_number: u64 },
}

struct Caches {
    by_hash: LruCache<Hash256, BlockHeader>,
    by_height: LruCache<u64, BlockHeader>,
}

/// A bounded cache of execution block headers, indexed both by hash and by height.
///
/// The two indices are evicted independently, so a header may remain reachable by one key after
/// it has been evicted from the other.
pub struct HeaderCache {
    caches: Mutex<Caches>,
}

impl HeaderCache {
    pub fn new(size: usize) -> Self {
        let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        Self {
            caches: Mutex::new(Caches {
                by_hash: LruCache::new(size),
                by_height: LruCache::new(size),
            }),
        }
    }

    pub fn add_header(&self, header: BlockHeader) -> Result<(), Error> {
        if header.hash.is_zero() {
            return Err(Error::ZeroHash {
                block_number: header.number,
            });
        }
        let mut caches = self.caches.lock();
        caches.by_height.put(header.number, header.clone());
        caches.by_hash.put(header.hash, header);
        Ok(())
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.caches.lock().by_hash.get(hash).cloned()
    }

    pub fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
        self.caches.lock().by_height.get(&height).cloned()
    }

    pub fn len(&self) -> usize {
        self.caches.lock().by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_CACHE_SIZE)
    }
}
