//! Chunk file container
//!
//! A chunk file starts with a fixed header followed by a table of chunk headers.
//! Each chunk header names a byte range elsewhere in the file. Readers always use
//! the declared offsets and sizes and never rely on the end of the file, so a
//! chunk file may be rewritten in place over a longer previous version.
//!
//! Layout (little-endian):
//!
//! ```text
//! file header (148 bytes)
//!   magic          [u8; 8]   "XACHUNK\0"
//!   format_version u32
//!   build_version  [u8; 64]  null terminated
//!   build_date     [u8; 64]  null terminated
//!   chunk_count    u32
//! chunk header (52 bytes) x chunk_count
//!   type_code      u64
//!   version        u32
//!   name           [u8; 32]  null terminated
//!   file_offset    u32
//!   size           u32
//! ```

use crate::error::{ArchiveError, Result};
use std::io::{Read, Seek, SeekFrom, Write};

pub const CHUNK_FILE_MAGIC: [u8; 8] = *b"XACHUNK\0";
pub const CHUNK_FILE_FORMAT_VERSION: u32 = 0;
pub const CHUNK_FILE_HEADER_SIZE: usize = 148;
pub const CHUNK_HEADER_SIZE: usize = 52;

const BUILD_STRING_SIZE: usize = 64;
const CHUNK_NAME_SIZE: usize = 32;

/// Fixed header at the start of every chunk file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFileHeader {
    pub format_version: u32,
    pub build_version: String,
    pub build_date: String,
    pub chunk_count: u32,
}

impl ChunkFileHeader {
    pub fn new(build_version: &str, build_date: &str, chunk_count: u32) -> Self {
        ChunkFileHeader {
            format_version: CHUNK_FILE_FORMAT_VERSION,
            build_version: build_version.to_string(),
            build_date: build_date.to_string(),
            chunk_count,
        }
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_FILE_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_FILE_HEADER_SIZE];
        buf[0..8].copy_from_slice(&CHUNK_FILE_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        write_fixed_string(&mut buf[12..76], &self.build_version);
        write_fixed_string(&mut buf[76..140], &self.build_date);
        buf[140..144].copy_from_slice(&self.chunk_count.to_le_bytes());
        // 144..148 reserved
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_FILE_HEADER_SIZE {
            return Err(ArchiveError::CorruptDirectory(format!(
                "chunk file header truncated ({} bytes)",
                buf.len()
            )));
        }
        if buf[0..8] != CHUNK_FILE_MAGIC {
            return Err(ArchiveError::InvalidMagic);
        }

        Ok(ChunkFileHeader {
            format_version: read_u32(&buf[8..12]),
            build_version: read_fixed_string(&buf[12..12 + BUILD_STRING_SIZE]),
            build_date: read_fixed_string(&buf[76..76 + BUILD_STRING_SIZE]),
            chunk_count: read_u32(&buf[140..144]),
        })
    }
}

/// One entry of the chunk table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub type_code: u64,
    pub version: u32,
    pub name: String,
    pub file_offset: u32,
    pub size: u32,
}

impl ChunkHeader {
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.type_code.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        write_fixed_string(&mut buf[12..44], &self.name);
        buf[44..48].copy_from_slice(&self.file_offset.to_le_bytes());
        buf[48..52].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; CHUNK_HEADER_SIZE]) -> Self {
        ChunkHeader {
            type_code: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            version: read_u32(&buf[8..12]),
            name: read_fixed_string(&buf[12..12 + CHUNK_NAME_SIZE]),
            file_offset: read_u32(&buf[44..48]),
            size: read_u32(&buf[48..52]),
        }
    }
}

/// A chunk to be written by [`write_chunk_file`]
#[derive(Debug, Clone, Copy)]
pub struct ChunkData<'a> {
    pub type_code: u64,
    pub version: u32,
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Read the file header and the chunk table from the start of `file`
pub fn load_chunk_table<R: Read + Seek>(file: &mut R) -> Result<(ChunkFileHeader, Vec<ChunkHeader>)> {
    file.seek(SeekFrom::Start(0))?;

    let mut header_buf = [0u8; CHUNK_FILE_HEADER_SIZE];
    file.read_exact(&mut header_buf)?;
    let header = ChunkFileHeader::from_bytes(&header_buf)?;

    // Don't trust chunk_count for preallocation
    let mut table = Vec::new();
    for _ in 0..header.chunk_count {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        table.push(ChunkHeader::from_bytes(&buf));
    }

    Ok((header, table))
}

/// Locate a chunk by type code and version
pub fn find_chunk(table: &[ChunkHeader], type_code: u64, version: u32) -> Result<&ChunkHeader> {
    table
        .iter()
        .find(|c| c.type_code == type_code && c.version == version)
        .ok_or(ArchiveError::ChunkNotFound { type_code, version })
}

/// Read the payload of one chunk
pub fn read_chunk<R: Read + Seek>(file: &mut R, chunk: &ChunkHeader) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(chunk.file_offset as u64))?;
    let mut data = Vec::new();
    file.by_ref().take(chunk.size as u64).read_to_end(&mut data)?;
    if data.len() != chunk.size as usize {
        return Err(ArchiveError::CorruptDirectory(format!(
            "chunk '{}' declares {} bytes but only {} are present",
            chunk.name,
            chunk.size,
            data.len()
        )));
    }
    Ok(data)
}

/// Write a complete chunk file starting at offset 0
///
/// The file is not truncated; trailing bytes of a longer previous version are
/// left in place. Returns the number of bytes written.
pub fn write_chunk_file<W: Write + Seek>(
    file: &mut W,
    build_version: &str,
    build_date: &str,
    chunks: &[ChunkData<'_>],
) -> Result<u64> {
    let header = ChunkFileHeader::new(build_version, build_date, chunks.len() as u32);

    let table_end = CHUNK_FILE_HEADER_SIZE + chunks.len() * CHUNK_HEADER_SIZE;
    let mut offset = table_end as u64;
    let mut headers = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let file_offset = u32::try_from(offset)
            .map_err(|_| ArchiveError::ArtifactTooLarge(offset))?;
        let size = u32::try_from(chunk.data.len())
            .map_err(|_| ArchiveError::ArtifactTooLarge(chunk.data.len() as u64))?;
        headers.push(ChunkHeader {
            type_code: chunk.type_code,
            version: chunk.version,
            name: chunk.name.to_string(),
            file_offset,
            size,
        });
        offset += size as u64;
    }

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    for h in &headers {
        file.write_all(&h.to_bytes())?;
    }
    for chunk in chunks {
        file.write_all(chunk.data)?;
    }
    file.flush()?;

    Ok(offset)
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Copy `value` into a fixed-size, null-terminated field, truncating on a char boundary
fn write_fixed_string(field: &mut [u8], value: &str) {
    let max = field.len() - 1;
    let mut len = value.len().min(max);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
    field[len..].fill(0);
}

fn read_fixed_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
