//! # Archive Cache - File-Backed Store for Build Artifacts
//!
//! `archive-cache` keeps the binary outputs of an asset build in one data file
//! per archive, so unchanged assets can be reloaded instead of rebuilt.
//!
//! - **Write buffer**: commits are held in memory and merged into the files on flush
//! - **Spanning heap**: artifacts are packed into 8-byte aligned blocks and freed
//!   space is reused by later flushes
//! - **Dependency validation**: each object records snapshots of the source files
//!   it was built from; stale objects are not opened
//! - **Attached strings**: display names, metrics and build logs live in a text
//!   side file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archive_cache::{
//!     ArchiveCache, Artifact, ArtifactRequest, AssetState, CacheConfig, LocalStorage, Result,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let storage = Arc::new(LocalStorage::new());
//! let cache = Arc::new(ArchiveCache::new(Some(storage), "cache/textures", CacheConfig::default()));
//!
//! // Buffer a build result
//! let texture = Artifact::new(0x1111, 1, "Texture", b"pixels".to_vec());
//! cache.commit(0xABC, "stone.png", vec![texture], AssetState::Ready, Vec::new(), None)?;
//!
//! // Write it to disk
//! cache.flush_to_disk()?;
//!
//! // Read it back
//! if let Some(collection) = cache.try_open_from_cache(0xABC) {
//!     let resolved = collection.resolve_requests(&[ArtifactRequest::new("Texture", 0x1111).version(1)])?;
//!     assert_eq!(resolved[0].bytes(), Some(&b"pixels"[..]));
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, artifact, cache, chunk, config, depval, directory, error, flush, pending, registry,
    resolve, storage, text_table,
};

pub use crate::core::{
    ArchiveCache, ArchiveCacheSet, ArchiveError, ArchiveMetrics, ArchivePaths, Artifact,
    ArtifactCollection, ArtifactRequest, AssetState, BlockMetrics, CacheConfig, DataKind,
    DependencyToken, DependentFile, FileSnapshot, FlushCallback, LocalStorage, MemoryStorage,
    ObjectId, ReopenHandle, ResolvedArtifact, Result, SnapshotState, SpanAllocator, SpanningHeap,
    Storage, StorageFile, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS,
};
