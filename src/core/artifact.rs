//! Artifacts and object states
//!
//! An object in the cache is a set of artifacts, each a typed, versioned blob.
//! Most artifacts are binary and live in the data file. Two reserved chunk types
//! (metrics and log output) are textual and are stored as attached strings in
//! the `.debug` side file instead.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use xxhash_rust::const_xxh3::xxh3_64;

/// Identifies one logical cached object
pub type ObjectId = u64;

/// Chunk type for attached metrics text
pub const CHUNK_TYPE_METRICS: u64 = xxh3_64(b"Metrics");

/// Chunk type for attached log text
pub const CHUNK_TYPE_LOG: u64 = xxh3_64(b"Log");

/// Binary artifacts are packed on this boundary in the data file
pub const BLOCK_ALIGNMENT: u32 = 8;

/// Filler written between packed artifacts
pub const PADDING_BYTE: u8 = 0xDD;

/// True if artifacts of this chunk type are stored in the data file
pub fn is_binary_chunk(chunk_type_code: u64) -> bool {
    chunk_type_code != CHUNK_TYPE_METRICS && chunk_type_code != CHUNK_TYPE_LOG
}

/// Round `size` up to the block alignment
pub fn padded_size(size: u32) -> u64 {
    let align = BLOCK_ALIGNMENT as u64;
    (size as u64).div_ceil(align) * align
}

/// Number of padding bytes written after a payload of `size` bytes
pub fn padding_for(size: u32) -> usize {
    (padded_size(size) - size as u64) as usize
}

/// One named, typed, versioned payload of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub chunk_type_code: u64,
    pub version: u32,
    pub name: String,
    pub data: Arc<Vec<u8>>,
}

impl Artifact {
    pub fn new(chunk_type_code: u64, version: u32, name: impl Into<String>, data: Vec<u8>) -> Self {
        Artifact {
            chunk_type_code,
            version,
            name: name.into(),
            data: Arc::new(data),
        }
    }

    /// Attached metrics text
    pub fn metrics(text: impl Into<String>) -> Self {
        Self::new(CHUNK_TYPE_METRICS, 0, "metrics", text.into().into_bytes())
    }

    /// Attached log text
    pub fn log(text: impl Into<String>) -> Self {
        Self::new(CHUNK_TYPE_LOG, 0, "log", text.into().into_bytes())
    }

    pub fn is_binary(&self) -> bool {
        is_binary_chunk(self.chunk_type_code)
    }
}

/// State of a cached object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AssetState {
    Pending = 0,
    Ready = 1,
    Invalid = 2,
}

impl AssetState {
    /// Decode a persisted state; unknown values read back as `Invalid`
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => AssetState::Pending,
            1 => AssetState::Ready,
            _ => AssetState::Invalid,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(padded_size(0), 0);
        assert_eq!(padded_size(1), 8);
        assert_eq!(padded_size(8), 8);
        assert_eq!(padded_size(13), 16);
        assert_eq!(padded_size(u32::MAX), 1 << 32);
        assert_eq!(padding_for(5), 3);
        assert_eq!(padding_for(16), 0);
    }

    #[test]
    fn test_reserved_chunk_types() {
        assert!(!is_binary_chunk(CHUNK_TYPE_METRICS));
        assert!(!is_binary_chunk(CHUNK_TYPE_LOG));
        assert!(is_binary_chunk(0x1111));
        assert!(Artifact::new(0x1111, 1, "a", b"x".to_vec()).is_binary());
        assert!(!Artifact::log("hello").is_binary());
    }

    #[test]
    fn test_state_decode() {
        assert_eq!(AssetState::from_u32(1), AssetState::Ready);
        assert_eq!(AssetState::from_u32(2), AssetState::Invalid);
        assert_eq!(AssetState::from_u32(77), AssetState::Invalid);
        assert_eq!(AssetState::Ready.as_u32(), 1);
    }
}
