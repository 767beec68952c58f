//! Registry of archive caches
//!
//! Hands out one shared [`ArchiveCache`] per archive name. Names are hashed
//! after normalizing path separators, so `a\b` and `a/b` refer to the same
//! cache.

use crate::cache::ArchiveCache;
use crate::error::Result;
use crate::storage::Storage;
use crate::CacheConfig;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// A set of archive caches sharing one storage backend and configuration
pub struct ArchiveCacheSet {
    storage: Option<Arc<dyn Storage>>,
    config: CacheConfig,
    archives: Mutex<AHashMap<u64, Arc<ArchiveCache>>>,
}

impl ArchiveCacheSet {
    pub fn new(storage: Option<Arc<dyn Storage>>, config: CacheConfig) -> Self {
        ArchiveCacheSet {
            storage,
            config,
            archives: Mutex::new(AHashMap::new()),
        }
    }

    /// The cache for `name`, created on first use
    pub fn get_archive(&self, name: impl AsRef<Path>) -> Arc<ArchiveCache> {
        let name = name.as_ref();
        let key = hash_archive_name(name);

        let mut archives = self.archives.lock();
        archives
            .entry(key)
            .or_insert_with(|| {
                debug!("Opening archive cache {}", name.display());
                Arc::new(ArchiveCache::new(
                    self.storage.clone(),
                    name,
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Number of caches created so far
    pub fn len(&self) -> usize {
        self.archives.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.lock().is_empty()
    }

    /// Flush every cache
    ///
    /// All caches are attempted; the first error is returned.
    pub fn flush_to_disk(&self) -> Result<()> {
        // Flush outside the registry lock
        let archives: Vec<Arc<ArchiveCache>> = self.archives.lock().values().cloned().collect();

        let mut first_error = None;
        for archive in archives {
            if let Err(e) = archive.flush_to_disk() {
                warn!("Failed to flush {}: {}", archive.paths().data.display(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush every cache and release the set
    pub fn close(self) -> Result<()> {
        self.flush_to_disk()
    }
}

/// Registry key for an archive name
pub fn hash_archive_name(name: &Path) -> u64 {
    let normalized = name.to_string_lossy().replace('\\', "/");
    xxh3_64(normalized.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, AssetState};
    use crate::storage::MemoryStorage;

    #[test]
    fn test_same_name_same_cache() {
        let set = ArchiveCacheSet::new(Some(Arc::new(MemoryStorage::new())), CacheConfig::default());
        let a = set.get_archive("cache/shaders");
        let b = set.get_archive("cache\\shaders");
        let c = set.get_archive("cache/models");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_flush_all() {
        let storage = MemoryStorage::new();
        let set = ArchiveCacheSet::new(Some(Arc::new(storage.clone())), CacheConfig::default());

        for name in ["one", "two"] {
            set.get_archive(name)
                .commit(1, name, vec![Artifact::new(0x5, 1, "x", b"data".to_vec())], AssetState::Ready, Vec::new(), None)
                .unwrap();
        }

        set.close().unwrap();
        assert!(storage.exists("one"));
        assert!(storage.exists("two.dir"));
    }

    #[test]
    fn test_first_error_reported_all_attempted() {
        let storage = MemoryStorage::new();
        let set = ArchiveCacheSet::new(Some(Arc::new(storage.clone())), CacheConfig::default());
        storage.fail_writes_to("bad");

        for name in ["bad", "good"] {
            set.get_archive(name)
                .commit(1, name, vec![Artifact::new(0x5, 1, "x", b"data".to_vec())], AssetState::Ready, Vec::new(), None)
                .unwrap();
        }

        assert!(set.flush_to_disk().is_err());
        assert!(storage.exists("good.dir"));
        assert_eq!(set.get_archive("bad").pending_commits(), 1);
        assert_eq!(set.get_archive("good").pending_commits(), 0);
    }
}
