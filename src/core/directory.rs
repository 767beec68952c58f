//! Archive directory
//!
//! The directory file (`<name>.dir`) is a chunk file holding a single
//! "ArchiveDirectory" chunk. The chunk records, for every object, its state
//! (the collections array) and where each binary artifact lives in the data
//! file (the blocks array), followed by the flattened spanning heap.

use crate::allocator::spanning::SpanningHeap;
use crate::artifact::{padded_size, AssetState, ObjectId};
use crate::chunk::{self, ChunkData};
use crate::error::{ArchiveError, Result};
use std::io::{Read, Seek, Write};
use std::ops::Range;
use xxhash_rust::const_xxh3::xxh3_64;

/// Chunk type of the directory chunk
pub const CHUNK_TYPE_ARCHIVE_DIRECTORY: u64 = xxh3_64(b"ArchiveDirectory");

/// Current version of the directory chunk
pub const DIRECTORY_CHUNK_VERSION: u32 = 1;

/// Name stored in the directory chunk header
pub const DIRECTORY_CHUNK_NAME: &str = "ArchiveCache";

const DIRECTORY_HEADER_SIZE: usize = 12;
const COLLECTION_RECORD_SIZE: usize = 12;
const ARTIFACT_BLOCK_SIZE: usize = 28;

/// Persisted state of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionRecord {
    pub object_id: ObjectId,
    pub state: AssetState,
}

/// Location of one binary artifact in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactBlock {
    pub object_id: ObjectId,
    pub chunk_type_code: u64,
    pub version: u32,
    pub start: u32,
    pub size: u32,
}

impl ArtifactBlock {
    /// Size including the alignment padding that follows the payload
    pub fn padded_size(&self) -> u64 {
        padded_size(self.size)
    }

    /// Byte range occupied in the data file, padding included
    pub fn padded_range(&self) -> Range<u64> {
        self.start as u64..self.start as u64 + self.padded_size()
    }
}

/// In-memory form of the directory chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveDirectory {
    /// Sorted by object id, unique
    pub collections: Vec<CollectionRecord>,
    /// Sorted by object id
    pub blocks: Vec<ArtifactBlock>,
    pub heap: SpanningHeap,
}

impl ArchiveDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index range of the blocks belonging to `object_id`
    pub fn block_range(&self, object_id: ObjectId) -> Range<usize> {
        block_range(&self.blocks, object_id)
    }

    /// Persisted state of `object_id`, if any
    pub fn collection_state(&self, object_id: ObjectId) -> Option<AssetState> {
        self.collections
            .binary_search_by_key(&object_id, |c| c.object_id)
            .ok()
            .map(|i| self.collections[i].state)
    }

    /// Encode the directory chunk payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let heap = self.heap.flatten();
        let mut buf = Vec::with_capacity(
            DIRECTORY_HEADER_SIZE
                + self.collections.len() * COLLECTION_RECORD_SIZE
                + self.blocks.len() * ARTIFACT_BLOCK_SIZE
                + heap.len(),
        );

        buf.extend_from_slice(&(self.collections.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(heap.len() as u32).to_le_bytes());

        for c in &self.collections {
            buf.extend_from_slice(&c.object_id.to_le_bytes());
            buf.extend_from_slice(&c.state.as_u32().to_le_bytes());
        }

        for b in &self.blocks {
            buf.extend_from_slice(&b.object_id.to_le_bytes());
            buf.extend_from_slice(&b.chunk_type_code.to_le_bytes());
            buf.extend_from_slice(&b.version.to_le_bytes());
            buf.extend_from_slice(&b.start.to_le_bytes());
            buf.extend_from_slice(&b.size.to_le_bytes());
        }

        buf.extend_from_slice(&heap);
        buf
    }

    /// Decode the directory chunk payload
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(buf);

        let collection_count = reader.u32()? as usize;
        let block_count = reader.u32()? as usize;
        let heap_size = reader.u32()? as usize;

        let needed = collection_count
            .checked_mul(COLLECTION_RECORD_SIZE)
            .and_then(|n| n.checked_add(block_count.checked_mul(ARTIFACT_BLOCK_SIZE)?))
            .and_then(|n| n.checked_add(heap_size))
            .ok_or_else(|| ArchiveError::CorruptDirectory("record counts overflow".to_string()))?;
        if reader.remaining() < needed {
            return Err(ArchiveError::CorruptDirectory(format!(
                "directory chunk needs {} bytes of records but has {}",
                needed,
                reader.remaining()
            )));
        }

        let mut collections = Vec::with_capacity(collection_count);
        for _ in 0..collection_count {
            collections.push(CollectionRecord {
                object_id: reader.u64()?,
                state: AssetState::from_u32(reader.u32()?),
            });
        }

        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let block = ArtifactBlock {
                object_id: reader.u64()?,
                chunk_type_code: reader.u64()?,
                version: reader.u32()?,
                start: reader.u32()?,
                size: reader.u32()?,
            };
            blocks.push(block);
        }

        if collections.windows(2).any(|w| w[0].object_id >= w[1].object_id) {
            return Err(ArchiveError::CorruptDirectory(
                "collection records are not sorted".to_string(),
            ));
        }
        if blocks.windows(2).any(|w| w[0].object_id > w[1].object_id) {
            return Err(ArchiveError::CorruptDirectory(
                "artifact blocks are not sorted".to_string(),
            ));
        }

        let heap = SpanningHeap::restore(reader.bytes(heap_size)?)?;
        check_block_layout(&blocks, &heap)?;

        Ok(ArchiveDirectory {
            collections,
            blocks,
            heap,
        })
    }

    /// Load the directory from a chunk file
    pub fn load<R: Read + Seek>(file: &mut R) -> Result<Self> {
        let (_, table) = chunk::load_chunk_table(file)?;
        let header = chunk::find_chunk(
            &table,
            CHUNK_TYPE_ARCHIVE_DIRECTORY,
            DIRECTORY_CHUNK_VERSION,
        )?;
        let payload = chunk::read_chunk(file, header)?;
        Self::from_bytes(&payload)
    }

    /// Write the directory as a single-chunk file from offset 0
    pub fn write<W: Write + Seek>(
        &self,
        file: &mut W,
        build_version: &str,
        build_date: &str,
    ) -> Result<u64> {
        let payload = self.to_bytes();
        let chunks = [ChunkData {
            type_code: CHUNK_TYPE_ARCHIVE_DIRECTORY,
            version: DIRECTORY_CHUNK_VERSION,
            name: DIRECTORY_CHUNK_NAME,
            data: &payload,
        }];
        chunk::write_chunk_file(file, build_version, build_date, &chunks)
    }
}

/// Every block must sit inside an allocated heap range and no two blocks may share bytes
fn check_block_layout(blocks: &[ArtifactBlock], heap: &SpanningHeap) -> Result<()> {
    let mut ranges = Vec::with_capacity(blocks.len());
    for block in blocks {
        let backed = u32::try_from(block.padded_size())
            .map(|size| heap.is_allocated(block.start, size))
            .unwrap_or(false);
        if !backed {
            return Err(ArchiveError::CorruptDirectory(format!(
                "block {}+{} of object {:#x} is not an allocated heap range",
                block.start, block.size, block.object_id
            )));
        }
        ranges.push(block.padded_range());
    }

    ranges.sort_by_key(|r| r.start);
    if let Some(pair) = ranges.windows(2).find(|w| w[0].end > w[1].start) {
        return Err(ArchiveError::CorruptDirectory(format!(
            "blocks at {} and {} overlap",
            pair[0].start, pair[1].start
        )));
    }
    Ok(())
}

/// Index range of the blocks belonging to `object_id` in a sorted block list
pub fn block_range(blocks: &[ArtifactBlock], object_id: ObjectId) -> Range<usize> {
    let start = blocks.partition_point(|b| b.object_id < object_id);
    let end = start + blocks[start..].partition_point(|b| b.object_id == object_id);
    start..end
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ArchiveError::CorruptDirectory(format!(
                "unexpected end of directory chunk at byte {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SpanAllocator;
    use std::io::Cursor;

    fn sample_directory() -> ArchiveDirectory {
        let mut heap = SpanningHeap::new();
        heap.append_new_block(48).unwrap();
        ArchiveDirectory {
            collections: vec![
                CollectionRecord { object_id: 0x10, state: AssetState::Ready },
                CollectionRecord { object_id: 0x20, state: AssetState::Invalid },
            ],
            blocks: vec![
                ArtifactBlock { object_id: 0x10, chunk_type_code: 1, version: 1, start: 0, size: 13 },
                ArtifactBlock { object_id: 0x10, chunk_type_code: 2, version: 3, start: 16, size: 8 },
                ArtifactBlock { object_id: 0x20, chunk_type_code: 1, version: 1, start: 24, size: 20 },
            ],
            heap,
        }
    }

    #[test]
    fn test_encoded_layout() {
        let dir = sample_directory();
        let bytes = dir.to_bytes();
        // header + 2 collections + 3 blocks + 3 heap markers
        assert_eq!(bytes.len(), 12 + 2 * 12 + 3 * 28 + 12);
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &12u32.to_le_bytes());
        assert_eq!(ArchiveDirectory::from_bytes(&bytes).unwrap(), dir);
    }

    #[test]
    fn test_block_range() {
        let dir = sample_directory();
        assert_eq!(dir.block_range(0x10), 0..2);
        assert_eq!(dir.block_range(0x20), 2..3);
        assert_eq!(dir.block_range(0x15), 2..2);
        assert_eq!(dir.block_range(0x99), 3..3);
        assert_eq!(dir.collection_state(0x20), Some(AssetState::Invalid));
        assert_eq!(dir.collection_state(0x30), None);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = sample_directory();
        let mut file = Cursor::new(Vec::new());
        dir.write(&mut file, "build", "date").unwrap();
        assert_eq!(ArchiveDirectory::load(&mut file).unwrap(), dir);
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = sample_directory().to_bytes();
        for cut in [0, 5, 12, 40, bytes.len() - 1] {
            assert!(ArchiveDirectory::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_huge_counts_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            ArchiveDirectory::from_bytes(&bytes),
            Err(ArchiveError::CorruptDirectory(_))
        ));
    }

    #[test]
    fn test_unsorted_blocks_rejected() {
        let mut dir = sample_directory();
        dir.blocks.swap(0, 2);
        assert!(ArchiveDirectory::from_bytes(&dir.to_bytes()).is_err());
    }

    #[test]
    fn test_block_outside_allocated_heap_rejected() {
        let mut dir = sample_directory();
        dir.heap = SpanningHeap::with_size(48);
        assert!(matches!(
            ArchiveDirectory::from_bytes(&dir.to_bytes()),
            Err(ArchiveError::CorruptDirectory(_))
        ));

        // Past the end of the heap
        let mut dir = sample_directory();
        dir.blocks[2].start = 40;
        assert!(ArchiveDirectory::from_bytes(&dir.to_bytes()).is_err());
    }

    #[test]
    fn test_overlapping_blocks_rejected() {
        let mut dir = sample_directory();
        dir.blocks[1].start = 8;
        assert!(matches!(
            ArchiveDirectory::from_bytes(&dir.to_bytes()),
            Err(ArchiveError::CorruptDirectory(_))
        ));
    }

    #[test]
    fn test_wrong_chunk_version() {
        let dir = sample_directory();
        let payload = dir.to_bytes();
        let mut file = Cursor::new(Vec::new());
        let chunks = [ChunkData {
            type_code: CHUNK_TYPE_ARCHIVE_DIRECTORY,
            version: DIRECTORY_CHUNK_VERSION + 1,
            name: DIRECTORY_CHUNK_NAME,
            data: &payload,
        }];
        chunk::write_chunk_file(&mut file, "b", "d", &chunks).unwrap();
        assert!(matches!(
            ArchiveDirectory::load(&mut file),
            Err(ArchiveError::ChunkNotFound { .. })
        ));
    }
}
