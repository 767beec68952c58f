//! Archive cache core
//!
//! - [`error`] - Error types
//! - [`allocator`] - Spanning heap that places artifacts in the data file
//! - [`chunk`] - Chunk file container used by the directory file
//! - [`directory`] - On-disk directory: object states, block locations, heap layout
//! - [`text_table`] - Escaped `key=value` tables for the debug and deps files
//! - [`depval`] - Dependency snapshots and validation
//! - [`storage`] - Filesystem abstraction with local and in-memory backends
//! - [`cache`] - The archive cache itself, with [`flush`] writing it out
//! - [`resolve`] - Resolving artifact requests against an opened object
//! - [`registry`] - One shared cache per archive name

pub mod allocator;
pub mod artifact;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod depval;
pub mod directory;
pub mod error;
pub mod flush;
pub mod pending;
pub mod registry;
pub mod resolve;
pub mod storage;
pub mod text_table;

pub use allocator::{spanning::SpanningHeap, SpanAllocator};
pub use artifact::{Artifact, AssetState, ObjectId, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS};
pub use cache::{ArchiveCache, ArchiveMetrics, ArchivePaths, BlockMetrics};
pub use config::CacheConfig;
pub use depval::{DependencyToken, DependentFile, FileSnapshot, SnapshotState};
pub use error::{ArchiveError, Result};
pub use pending::FlushCallback;
pub use registry::ArchiveCacheSet;
pub use resolve::{ArtifactCollection, ArtifactRequest, DataKind, ReopenHandle, ResolvedArtifact};
pub use storage::{LocalStorage, MemoryStorage, Storage, StorageFile};
