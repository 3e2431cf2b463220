use std::num::NonZeroUsize;

use lru::LruCache;

use dup_types::{Timestamp, PATHS_CACHE_CAP};

/// Size-bounded LRU of `{interface, path}` pairs whose path-registry row
/// is known to be fresh. Entries may carry an absolute expiry; without one
/// they stay valid until evicted.
pub struct PathsCache {
    entries: LruCache<(String, String), Option<Timestamp>>,
}

impl Default for PathsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PathsCache {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(PATHS_CACHE_CAP).unwrap()),
        }
    }

    pub fn contains(&mut self, interface: &str, path: &str, now: Timestamp) -> bool {
        let key = (interface.to_string(), path.to_string());
        match self.entries.get(&key) {
            None => false,
            Some(None) => true,
            Some(Some(expiry)) if *expiry > now => true,
            Some(Some(_)) => {
                self.entries.pop(&key);
                false
            }
        }
    }

    pub fn insert(&mut self, interface: &str, path: &str, expiry: Option<Timestamp>) {
        self.entries
            .put((interface.to_string(), path.to_string()), expiry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
