//! Archive cache
//!
//! An [`ArchiveCache`] owns four files on its storage backend:
//!
//! - `<name>`: the data file, a spanning heap of packed binary artifacts
//! - `<name>.dir`: the directory (object states, block locations, heap layout)
//! - `<name>.debug`: attached strings (display names, metrics and log text)
//! - `<name>.deps`: dependency snapshots per object
//!
//! Producers [`commit`](ArchiveCache::commit) objects into an in-memory write
//! buffer which is merged into the files by
//! [`flush_to_disk`](ArchiveCache::flush_to_disk). Consumers open objects with
//! [`try_open_from_cache`](ArchiveCache::try_open_from_cache) and read from the
//! buffered copy if there is one, otherwise from the files.
//!
//! One mutex guards the write buffer, the change ids and the cached read-side
//! snapshots of the directory and dependency table.

use crate::artifact::{Artifact, AssetState, ObjectId};
use crate::depval::{self, DependencyTable, DependencyToken, DependentFile};
use crate::directory::ArchiveDirectory;
use crate::error::{ArchiveError, Result};
use crate::pending::{FlushCallback, PendingCommit, WriteBuffer};
use crate::resolve::ArtifactCollection;
use crate::storage::Storage;
use crate::text_table;
use crate::CacheConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Locations of the files that make up one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePaths {
    pub data: PathBuf,
    pub directory: PathBuf,
    pub debug: PathBuf,
    pub deps: PathBuf,
}

impl ArchivePaths {
    pub fn new(main_file: impl Into<PathBuf>) -> Self {
        let data = main_file.into();
        ArchivePaths {
            directory: with_suffix(&data, ".dir"),
            debug: with_suffix(&data, ".debug"),
            deps: with_suffix(&data, ".deps"),
            data,
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// State guarded by the cache lock
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) buffer: WriteBuffer,
    directory: Option<Arc<ArchiveDirectory>>,
    dependencies: Option<Arc<DependencyTable>>,
}

impl CacheState {
    /// Forget the read-side snapshots; they are reloaded on next use
    pub(crate) fn invalidate_snapshots(&mut self) {
        self.directory = None;
        self.dependencies = None;
    }

    /// Directory snapshot, loading it if needed. Failures are not cached.
    pub(crate) fn directory(&mut self, storage: &dyn Storage, path: &Path) -> Result<Arc<ArchiveDirectory>> {
        if let Some(directory) = &self.directory {
            return Ok(directory.clone());
        }

        let directory = read_directory(storage, path)
            .map_err(|e| ArchiveError::DirectoryUnavailable(format!("{}: {}", path.display(), e)))?;
        let directory = Arc::new(directory);
        self.directory = Some(directory.clone());
        Ok(directory)
    }

    /// Dependency table snapshot, loading it if needed
    pub(crate) fn dependencies(&mut self, storage: &dyn Storage, path: &Path) -> Result<Arc<DependencyTable>> {
        if let Some(table) = &self.dependencies {
            return Ok(table.clone());
        }

        let table = Arc::new(load_dependency_table(storage, path)?);
        self.dependencies = Some(table.clone());
        Ok(table)
    }
}

/// Read the directory file; a missing or empty file is an empty directory
pub(crate) fn read_directory(storage: &dyn Storage, path: &Path) -> Result<ArchiveDirectory> {
    let mut file = match storage.open_read(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ArchiveDirectory::new()),
        Err(e) => return Err(e.into()),
    };
    if storage.file_size(path)? == 0 {
        return Ok(ArchiveDirectory::new());
    }
    ArchiveDirectory::load(&mut file)
}

/// Load the `.debug` table. Missing or unparsable files read as empty.
pub(crate) fn load_debug_strings(storage: &dyn Storage, path: &Path) -> Result<BTreeMap<String, String>> {
    let bytes = match storage.read_all(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    match text_table::parse_table(&String::from_utf8_lossy(&bytes)) {
        Ok(table) => Ok(table),
        Err(e) => {
            warn!("Discarding unreadable attached string table {}: {}", path.display(), e);
            Ok(BTreeMap::new())
        }
    }
}

/// Load the `.deps` table. Missing or unparsable files read as empty.
pub(crate) fn load_dependency_table(storage: &dyn Storage, path: &Path) -> Result<DependencyTable> {
    let bytes = match storage.read_all(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DependencyTable::new()),
        Err(e) => return Err(e.into()),
    };
    match depval::parse_dependency_table(&String::from_utf8_lossy(&bytes)) {
        Ok(table) => Ok(table),
        Err(e) => {
            warn!("Discarding unreadable dependency table {}: {}", path.display(), e);
            Ok(DependencyTable::new())
        }
    }
}

/// Key under which an object's display name is stored in the `.debug` table
pub(crate) fn object_key(object_id: ObjectId) -> String {
    format!("{:x}", object_id)
}

/// Space used by one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockMetrics {
    pub object_id: ObjectId,
    /// Start in the data file; `None` while the object is only buffered
    pub offset: Option<u32>,
    pub size: u64,
    pub attached_string: Option<String>,
}

/// Space usage of an archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveMetrics {
    /// Padded bytes occupied by flushed objects
    pub used_space: u64,
    /// Current size of the data file
    pub allocated_file_size: u64,
    pub blocks: Vec<BlockMetrics>,
}

/// A file-backed cache of build artifacts
pub struct ArchiveCache {
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) paths: ArchivePaths,
    pub(crate) config: CacheConfig,
    pub(crate) state: Mutex<CacheState>,
}

impl ArchiveCache {
    /// Create a cache over `main_file`
    ///
    /// Without a storage backend the cache only ever holds buffered objects.
    pub fn new(
        storage: Option<Arc<dyn Storage>>,
        main_file: impl Into<PathBuf>,
        config: CacheConfig,
    ) -> Self {
        let paths = ArchivePaths::new(main_file);

        if let Some(storage) = &storage {
            if config.create_directories {
                if let Some(parent) = paths.data.parent() {
                    if let Err(e) = storage.create_dir_all(parent) {
                        warn!("Could not create archive directory {}: {}", parent.display(), e);
                    }
                }
            }
        }

        debug!("Created archive cache for {}", paths.data.display());
        ArchiveCache {
            storage,
            paths,
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    /// Buffer a new version of an object
    ///
    /// Replaces any commit for the same object that hasn't been flushed yet.
    /// Nothing is mutated when validation fails.
    pub fn commit(
        &self,
        object_id: ObjectId,
        display_name: impl Into<String>,
        artifacts: Vec<Artifact>,
        state: AssetState,
        deps: Vec<DependentFile>,
        on_flush: Option<FlushCallback>,
    ) -> Result<()> {
        let commit = PendingCommit::new(object_id, display_name, artifacts, state, deps, on_flush)?;

        let mut cache_state = self.state.lock();
        let size = commit.total_binary_size;
        let change_id = cache_state.buffer.insert(commit);
        debug!(
            "Committed object {:#x} ({} binary bytes, change id {})",
            object_id, size, change_id
        );
        Ok(())
    }

    /// Number of commits waiting for the next flush
    pub fn pending_commits(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Open an object if it is present and up to date
    ///
    /// Returns `None` for unknown objects and for objects whose source files
    /// changed since they were built. With dependency checking disabled every
    /// id opens; missing data then surfaces when requests are resolved.
    pub fn try_open_from_cache(self: &Arc<Self>, object_id: ObjectId) -> Option<ArtifactCollection> {
        let mut state = self.state.lock();
        let change_id = state.buffer.change_id(object_id);
        let collection = ArtifactCollection::new(self.clone(), object_id, change_id);

        if !self.config.check_dependencies {
            return Some(collection);
        }

        match self.lookup_dependencies(&mut state, object_id) {
            Ok(Some(token)) if self.token_is_valid(&token) => Some(collection),
            Ok(Some(_)) => {
                debug!("Object {:#x} is out of date", object_id);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Could not validate object {:#x}: {}", object_id, e);
                None
            }
        }
    }

    /// Dependencies recorded for an object; `None` if the cache doesn't know it
    pub(crate) fn lookup_dependencies(
        &self,
        state: &mut CacheState,
        object_id: ObjectId,
    ) -> Result<Option<DependencyToken>> {
        if let Some(commit) = state.buffer.get(object_id) {
            return Ok(Some(commit.dep_val.clone()));
        }

        let storage = match &self.storage {
            Some(storage) => storage.as_ref(),
            None => return Ok(None),
        };

        let directory = state.directory(storage, &self.paths.directory)?;
        if directory.collection_state(object_id).is_none() {
            return Ok(None);
        }

        let table = state.dependencies(storage, &self.paths.deps)?;
        let files = table.get(&object_id).cloned().unwrap_or_default();
        Ok(Some(DependencyToken::new(files)))
    }

    pub(crate) fn token_is_valid(&self, token: &DependencyToken) -> bool {
        match &self.storage {
            Some(storage) => token.is_valid(storage.as_ref()),
            None => true,
        }
    }

    /// Space usage of flushed and buffered objects
    ///
    /// Buffered objects replace their flushed entry and report no offset. An
    /// unreadable directory contributes nothing.
    pub fn metrics(&self) -> ArchiveMetrics {
        let mut state = self.state.lock();
        let mut metrics = ArchiveMetrics::default();

        if let Some(storage) = &self.storage {
            let storage = storage.as_ref();
            match state.directory(storage, &self.paths.directory) {
                Ok(directory) => {
                    let debug_strings = load_debug_strings(storage, &self.paths.debug)
                        .unwrap_or_else(|e| {
                            warn!("Could not read attached strings: {}", e);
                            BTreeMap::new()
                        });

                    for run in directory.blocks.chunk_by(|a, b| a.object_id == b.object_id) {
                        let object_id = run[0].object_id;
                        let size: u64 = run.iter().map(|b| b.padded_size()).sum();
                        metrics.used_space += size;
                        metrics.blocks.push(BlockMetrics {
                            object_id,
                            offset: Some(run[0].start),
                            size,
                            attached_string: debug_strings.get(&object_key(object_id)).cloned(),
                        });
                    }
                }
                Err(e) => warn!("Metrics skipped flushed objects: {}", e),
            }

            metrics.allocated_file_size = storage.file_size(&self.paths.data).unwrap_or(0);
        }

        for commit in state.buffer.commits() {
            let entry = BlockMetrics {
                object_id: commit.object_id,
                offset: None,
                size: commit.total_binary_size as u64,
                attached_string: None,
            };
            match metrics
                .blocks
                .binary_search_by_key(&commit.object_id, |b| b.object_id)
            {
                Ok(index) => metrics.blocks[index] = entry,
                Err(index) => metrics.blocks.insert(index, entry),
            }
        }

        metrics
    }

    /// Flush pending commits and report any failure
    pub fn close(&self) -> Result<()> {
        self.flush_to_disk()
    }
}

impl Drop for ArchiveCache {
    fn drop(&mut self) {
        let pending = self.state.get_mut().buffer.len();
        if pending > 0 {
            warn!(
                "Archive cache {} dropped with {} unflushed commits",
                self.paths.data.display(),
                pending
            );
        }
    }
}

impl fmt::Debug for ArchiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveCache")
            .field("paths", &self.paths)
            .field("has_storage", &self.storage.is_some())
            .field("config", &self.config)
            .finish()
    }
}
