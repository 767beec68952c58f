use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Invalid magic number in chunk file header")]
    InvalidMagic,

    #[error("Corrupt archive directory: {0}")]
    CorruptDirectory(String),

    #[error("Chunk not found: type {type_code:#x}, version {version}")]
    ChunkNotFound { type_code: u64, version: u32 },

    #[error("Text table format error on line {line}: {reason}")]
    TextFormat { line: usize, reason: String },

    #[error("One or more artifacts contain no data (object {0:#x})")]
    InvalidArtifact(u64),

    #[error("Artifact data too large for archive address space: {0} bytes")]
    ArtifactTooLarge(u64),

    #[error("Cannot commit object {0:#x} in the pending state")]
    InvalidState(u64),

    #[error("Object {0:#x} changed while attempting to read it at the same time")]
    ConcurrentModification(u64),

    #[error("Missing chunk ({name}) for object {object_id:#x}")]
    MissingChunk { object_id: u64, name: String },

    #[error("Data chunk is incorrect version for chunk ({name}) expected: {expected}, got: {actual}")]
    UnsupportedVersion {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("Type code {0:#x} is repeated multiple times in one request list")]
    DuplicateRequest(u64),

    #[error("Chunk ({0}) cannot be opened in the requested data mode")]
    UnsupportedDataKind(String),

    #[error("Archive directory could not be loaded: {0}")]
    DirectoryUnavailable(String),

    #[error("Spanning heap exhausted: cannot grow by {0} bytes")]
    HeapExhausted(u32),

    #[error("Heap range {offset}+{size} is not an allocated range")]
    InvalidHeapRange { offset: u32, size: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
