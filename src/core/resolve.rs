//! Reading objects back
//!
//! [`ArtifactCollection`] is the handle returned by
//! [`ArchiveCache::try_open_from_cache`]. It remembers the object's change id
//! at the time it was opened; every later call re-checks it under the cache
//! lock and fails with [`ArchiveError::ConcurrentModification`] if the object
//! was committed again in the meantime.
//!
//! Requests are served from the buffered commit if the object has one,
//! otherwise from the archive files.

use crate::artifact::{is_binary_chunk, AssetState, ObjectId, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS};
use crate::cache::{load_debug_strings, object_key, ArchiveCache, CacheState};
use crate::depval::DependencyToken;
use crate::directory::ArtifactBlock;
use crate::error::{ArchiveError, Result};
use crate::pending::PendingCommit;
use crate::storage::StorageFile;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::debug;

/// How a resolved payload is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Shared, reference-counted bytes
    SharedBlob,
    /// An owned copy
    Raw,
    /// A handle that opens a reader over the payload later
    Reopen,
}

/// One payload wanted from an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub name: String,
    pub chunk_type_code: u64,
    /// `None` accepts any version
    pub expected_version: Option<u32>,
    pub data_kind: DataKind,
    /// Missing optional chunks resolve to [`ResolvedArtifact::Empty`] when read from disk
    pub optional: bool,
}

impl ArtifactRequest {
    pub fn new(name: impl Into<String>, chunk_type_code: u64) -> Self {
        ArtifactRequest {
            name: name.into(),
            chunk_type_code,
            expected_version: None,
            data_kind: DataKind::SharedBlob,
            optional: false,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn kind(mut self, kind: DataKind) -> Self {
        self.data_kind = kind;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn check_version(&self, actual: u32) -> Result<()> {
        match self.expected_version {
            Some(expected) if expected != actual => Err(ArchiveError::UnsupportedVersion {
                name: self.name.clone(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

/// A resolved payload
#[derive(Debug, Clone)]
pub enum ResolvedArtifact {
    Blob(Arc<Vec<u8>>),
    Raw(Vec<u8>),
    Reopen(ReopenHandle),
    /// An optional chunk that wasn't there
    Empty,
}

impl ResolvedArtifact {
    /// The bytes, for blob and raw results
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ResolvedArtifact::Blob(data) => Some(data.as_slice()),
            ResolvedArtifact::Raw(data) => Some(data.as_slice()),
            ResolvedArtifact::Reopen(_) | ResolvedArtifact::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResolvedArtifact::Empty)
    }

    fn from_shared(kind: DataKind, data: Arc<Vec<u8>>) -> Self {
        match kind {
            DataKind::SharedBlob => ResolvedArtifact::Blob(data),
            DataKind::Raw => ResolvedArtifact::Raw(data.as_ref().clone()),
            DataKind::Reopen => ResolvedArtifact::Reopen(ReopenHandle {
                source: ReopenSource::Buffered(data),
            }),
        }
    }
}

/// A reader that can be boxed and handed out
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Deferred access to a payload
///
/// For flushed objects this captures the location in the data file; reopening
/// verifies that the object hasn't been committed again since.
#[derive(Clone)]
pub struct ReopenHandle {
    source: ReopenSource,
}

#[derive(Clone)]
enum ReopenSource {
    Buffered(Arc<Vec<u8>>),
    Archive {
        cache: Arc<ArchiveCache>,
        object_id: ObjectId,
        change_id: u32,
        offset: u32,
        size: u32,
    },
}

impl ReopenHandle {
    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        match &self.source {
            ReopenSource::Buffered(data) => data.len() as u64,
            ReopenSource::Archive { size, .. } => *size as u64,
        }
    }

    /// Open a fresh reader positioned at the start of the payload
    pub fn reopen(&self) -> Result<Box<dyn ReadSeek>> {
        match &self.source {
            ReopenSource::Buffered(data) => Ok(Box::new(Cursor::new(SharedBytes(data.clone())))),
            ReopenSource::Archive {
                cache,
                object_id,
                change_id,
                offset,
                size,
            } => {
                let state = cache.state.lock();
                verify_change_id(&state, *object_id, *change_id)?;

                let storage = cache
                    .storage
                    .as_ref()
                    .ok_or_else(|| ArchiveError::MissingChunk {
                        object_id: *object_id,
                        name: "reopen".to_string(),
                    })?;
                let mut file = storage.open_read(&cache.paths.data)?;
                file.seek(SeekFrom::Start(*offset as u64))?;
                Ok(Box::new(ChunkReader {
                    file,
                    start: *offset as u64,
                    len: *size as u64,
                    position: 0,
                }))
            }
        }
    }
}

impl fmt::Debug for ReopenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ReopenSource::Buffered(data) => f
                .debug_struct("ReopenHandle")
                .field("buffered_bytes", &data.len())
                .finish(),
            ReopenSource::Archive {
                object_id,
                change_id,
                offset,
                size,
                ..
            } => f
                .debug_struct("ReopenHandle")
                .field("object_id", &format_args!("{:#x}", object_id))
                .field("change_id", change_id)
                .field("offset", offset)
                .field("size", size)
                .finish(),
        }
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Window over one payload inside the data file
struct ChunkReader {
    file: Box<dyn StorageFile>,
    start: u64,
    len: u64,
    position: u64,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.position);
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let n = self.file.read(&mut buf[..want])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ChunkReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => self.len as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of chunk",
            ));
        }
        self.position = target as u64;
        self.file.seek(SeekFrom::Start(self.start + self.position))?;
        Ok(self.position)
    }
}

fn verify_change_id(state: &CacheState, object_id: ObjectId, change_id: u32) -> Result<()> {
    if state.buffer.change_id(object_id) != change_id {
        return Err(ArchiveError::ConcurrentModification(object_id));
    }
    Ok(())
}

/// An opened object
#[derive(Debug, Clone)]
pub struct ArtifactCollection {
    cache: Arc<ArchiveCache>,
    object_id: ObjectId,
    change_id: u32,
}

impl ArtifactCollection {
    pub(crate) fn new(cache: Arc<ArchiveCache>, object_id: ObjectId, change_id: u32) -> Self {
        ArtifactCollection {
            cache,
            object_id,
            change_id,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Change id captured when the object was opened
    pub fn change_id(&self) -> u32 {
        self.change_id
    }

    /// Resolve a list of requests, all or nothing
    pub fn resolve_requests(&self, requests: &[ArtifactRequest]) -> Result<Vec<ResolvedArtifact>> {
        let mut state = self.cache.state.lock();
        verify_change_id(&state, self.object_id, self.change_id)?;

        for (i, request) in requests.iter().enumerate() {
            if requests[..i]
                .iter()
                .any(|r| r.chunk_type_code == request.chunk_type_code)
            {
                return Err(ArchiveError::DuplicateRequest(request.chunk_type_code));
            }
        }

        if let Some(commit) = state.buffer.get(self.object_id) {
            return self.resolve_buffered(commit, requests);
        }
        self.resolve_from_archive(&mut state, requests)
    }

    fn resolve_buffered(&self, commit: &PendingCommit, requests: &[ArtifactRequest]) -> Result<Vec<ResolvedArtifact>> {
        // Check everything before building any results
        let mut found = Vec::with_capacity(requests.len());
        for request in requests {
            let artifact = commit
                .find_artifact(request.chunk_type_code)
                .ok_or_else(|| ArchiveError::MissingChunk {
                    object_id: self.object_id,
                    name: request.name.clone(),
                })?;
            request.check_version(artifact.version)?;
            found.push(artifact);
        }

        Ok(requests
            .iter()
            .zip(found)
            .map(|(request, artifact)| ResolvedArtifact::from_shared(request.data_kind, artifact.data.clone()))
            .collect())
    }

    fn resolve_from_archive(
        &self,
        state: &mut CacheState,
        requests: &[ArtifactRequest],
    ) -> Result<Vec<ResolvedArtifact>> {
        let storage = self.cache.storage.clone();
        let directory = match &storage {
            Some(storage) => Some(state.directory(storage.as_ref(), &self.cache.paths.directory)?),
            None => None,
        };
        let blocks: &[ArtifactBlock] = match &directory {
            Some(directory) => &directory.blocks[directory.block_range(self.object_id)],
            None => &[],
        };

        // First pass: make sure every required chunk is present and of the right version
        let mut needs_attached = false;
        let mut located: Vec<Option<&ArtifactBlock>> = Vec::with_capacity(requests.len());
        for request in requests {
            if !is_binary_chunk(request.chunk_type_code) {
                if request.data_kind == DataKind::Reopen {
                    return Err(ArchiveError::UnsupportedDataKind(request.name.clone()));
                }
                needs_attached = true;
                located.push(None);
                continue;
            }

            let block = blocks
                .iter()
                .find(|b| b.chunk_type_code == request.chunk_type_code);
            match block {
                Some(block) => request.check_version(block.version)?,
                None if request.optional => {}
                None => {
                    return Err(ArchiveError::MissingChunk {
                        object_id: self.object_id,
                        name: request.name.clone(),
                    })
                }
            }
            located.push(block);
        }

        let attached = match (&storage, needs_attached) {
            (Some(storage), true) => {
                debug!("Reading attached strings for object {:#x}", self.object_id);
                load_debug_strings(storage.as_ref(), &self.cache.paths.debug)?
            }
            _ => BTreeMap::new(),
        };
        let display_name = attached.get(&object_key(self.object_id));

        // Second pass: read the data
        let needs_data_file = requests
            .iter()
            .zip(&located)
            .any(|(r, b)| b.is_some() && r.data_kind != DataKind::Reopen);
        let mut data_file = match (&storage, needs_data_file) {
            (Some(storage), true) => Some((
                storage.open_read(&self.cache.paths.data)?,
                storage.file_size(&self.cache.paths.data)?,
            )),
            _ => None,
        };

        let mut results = Vec::with_capacity(requests.len());
        for (request, block) in requests.iter().zip(located) {
            if !is_binary_chunk(request.chunk_type_code) {
                let suffix = if request.chunk_type_code == CHUNK_TYPE_METRICS {
                    "-metrics"
                } else {
                    debug_assert_eq!(request.chunk_type_code, CHUNK_TYPE_LOG);
                    "-log"
                };
                let text = display_name.and_then(|name| attached.get(&format!("{}{}", name, suffix)));
                match text {
                    Some(text) => results.push(ResolvedArtifact::from_shared(
                        request.data_kind,
                        Arc::new(text.clone().into_bytes()),
                    )),
                    None if request.optional => results.push(ResolvedArtifact::Empty),
                    None => {
                        return Err(ArchiveError::MissingChunk {
                            object_id: self.object_id,
                            name: request.name.clone(),
                        })
                    }
                }
                continue;
            }

            let block = match block {
                Some(block) => block,
                None => {
                    results.push(ResolvedArtifact::Empty);
                    continue;
                }
            };

            if request.data_kind == DataKind::Reopen {
                results.push(ResolvedArtifact::Reopen(ReopenHandle {
                    source: ReopenSource::Archive {
                        cache: self.cache.clone(),
                        object_id: self.object_id,
                        change_id: self.change_id,
                        offset: block.start,
                        size: block.size,
                    },
                }));
                continue;
            }

            // Blocks only exist when storage does
            let (file, data_len) = data_file.as_mut().ok_or_else(|| ArchiveError::MissingChunk {
                object_id: self.object_id,
                name: request.name.clone(),
            })?;

            if block.start as u64 + block.size as u64 > *data_len {
                return Err(ArchiveError::CorruptDirectory(format!(
                    "chunk ({}) of object {:#x} ends at {} past the {} byte data file",
                    request.name,
                    self.object_id,
                    block.start as u64 + block.size as u64,
                    data_len
                )));
            }

            let mut data = vec![0u8; block.size as usize];
            file.seek(SeekFrom::Start(block.start as u64))?;
            file.read_exact(&mut data)?;

            results.push(match request.data_kind {
                DataKind::Raw => ResolvedArtifact::Raw(data),
                _ => ResolvedArtifact::Blob(Arc::new(data)),
            });
        }

        Ok(results)
    }

    /// State of the object: buffered, then flushed, otherwise `Invalid`
    pub fn asset_state(&self) -> Result<AssetState> {
        let mut state = self.cache.state.lock();
        verify_change_id(&state, self.object_id, self.change_id)?;

        if let Some(commit) = state.buffer.get(self.object_id) {
            return Ok(commit.state);
        }

        let storage = match &self.cache.storage {
            Some(storage) => storage.clone(),
            None => return Ok(AssetState::Invalid),
        };
        let directory = state.directory(storage.as_ref(), &self.cache.paths.directory)?;
        Ok(directory
            .collection_state(self.object_id)
            .unwrap_or(AssetState::Invalid))
    }

    /// Dependencies the object was built from
    pub fn dependency_validation(&self) -> Result<DependencyToken> {
        let mut state = self.cache.state.lock();
        verify_change_id(&state, self.object_id, self.change_id)?;

        Ok(self
            .cache
            .lookup_dependencies(&mut state, self.object_id)?
            .unwrap_or_default())
    }
}
