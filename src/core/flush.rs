//! Flushing the write buffer
//!
//! A flush merges every buffered commit into the archive files in one pass:
//!
//! 1. load the existing directory (anything unreadable means starting empty)
//! 2. merge the new object states into the collection records
//! 3. hand the old blocks of every rewritten object back to the heap
//! 4. allocate space for the new objects, largest first
//! 5. write the artifacts into the data file in offset order
//! 6. rewrite the directory file
//! 7. merge the attached strings and dependency tables (best effort)
//!
//! Failures up to and including step 6 are fatal and leave the write buffer
//! untouched so the flush can be retried. Completion callbacks run after the
//! buffer has been cleared and the cache lock released.

use crate::allocator::SpanAllocator;
use crate::artifact::{padded_size, padding_for, PADDING_BYTE};
use crate::artifact::{CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS};
use crate::cache::{load_debug_strings, load_dependency_table, object_key, ArchiveCache, ArchivePaths};
use crate::depval;
use crate::directory::{ArchiveDirectory, ArtifactBlock, CollectionRecord};
use crate::error::{ArchiveError, Result};
use crate::pending::PendingCommit;
use crate::storage::{Storage, StorageFile};
use crate::text_table;
use crate::CacheConfig;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Where one commit landed in the data file
#[derive(Debug, Clone, Copy)]
struct Placement {
    commit: usize,
    offset: u32,
}

#[derive(Debug, Default)]
struct FlushSummary {
    objects: usize,
    data_bytes: u64,
    directory_bytes: u64,
    heap_size: u32,
}

impl ArchiveCache {
    /// Write every buffered commit out to the archive files
    ///
    /// Does nothing when the buffer is empty or the cache has no storage.
    pub fn flush_to_disk(&self) -> Result<()> {
        let callbacks = {
            let mut state = self.state.lock();
            if state.buffer.is_empty() {
                return Ok(());
            }
            let storage = match &self.storage {
                Some(storage) => storage.as_ref(),
                None => {
                    debug!("No storage attached, keeping {} commits buffered", state.buffer.len());
                    return Ok(());
                }
            };

            state.invalidate_snapshots();

            let summary = write_commits(storage, &self.paths, &self.config, state.buffer.commits())?;
            info!(
                "Flushed {} objects to {} ({} data bytes, {} directory bytes, heap {} bytes)",
                summary.objects,
                self.paths.data.display(),
                summary.data_bytes,
                summary.directory_bytes,
                summary.heap_size
            );

            state
                .buffer
                .take_all()
                .into_iter()
                .filter_map(|commit| commit.on_flush)
                .collect::<Vec<_>>()
        };

        for callback in callbacks {
            callback();
        }
        Ok(())
    }
}

fn write_commits(
    storage: &dyn Storage,
    paths: &ArchivePaths,
    config: &CacheConfig,
    commits: &[PendingCommit],
) -> Result<FlushSummary> {
    let mut directory_file = storage.open_or_create(&paths.directory)?;
    let mut directory = load_existing_directory(&mut directory_file, &paths.directory);

    merge_collections(&mut directory.collections, commits);
    release_blocks(&mut directory, commits);
    let placements = place_commits(&mut directory, commits)?;

    let data_bytes = write_data_file(storage, &paths.data, commits, &placements)?;

    let directory_bytes = directory.write(&mut directory_file, &config.build_version, &config.build_date)?;
    directory_file.sync()?;

    if let Err(e) = update_debug_strings(storage, &paths.debug, commits) {
        warn!("Failed to update attached strings in {}: {}", paths.debug.display(), e);
    }
    if let Err(e) = update_dependencies(storage, &paths.deps, commits) {
        warn!("Failed to update dependency table in {}: {}", paths.deps.display(), e);
    }

    Ok(FlushSummary {
        objects: commits.len(),
        data_bytes,
        directory_bytes,
        heap_size: directory.heap.heap_size(),
    })
}

/// Best-effort load of the directory from an open file
fn load_existing_directory(file: &mut Box<dyn StorageFile>, path: &Path) -> ArchiveDirectory {
    match file.seek(SeekFrom::End(0)) {
        Ok(0) => return ArchiveDirectory::new(),
        Ok(_) => {}
        Err(e) => {
            warn!("Could not size directory file {}: {}", path.display(), e);
            return ArchiveDirectory::new();
        }
    }

    match ArchiveDirectory::load(file) {
        Ok(directory) => directory,
        Err(e) => {
            warn!(
                "Directory file {} is unreadable, rebuilding from empty: {}",
                path.display(),
                e
            );
            ArchiveDirectory::new()
        }
    }
}

/// Merge-join the new object states into the sorted collection records
fn merge_collections(collections: &mut Vec<CollectionRecord>, commits: &[PendingCommit]) {
    let updates: Vec<CollectionRecord> = commits
        .iter()
        .map(|c| CollectionRecord {
            object_id: c.object_id,
            state: c.state,
        })
        .collect();
    debug_assert!(updates.windows(2).all(|w| w[0].object_id < w[1].object_id));

    let existing = std::mem::take(collections);
    let mut merged = Vec::with_capacity(existing.len() + updates.len());
    let mut old = existing.into_iter().peekable();
    let mut new = updates.into_iter().peekable();

    loop {
        let next_old = old.peek().map(|c| c.object_id);
        let next_new = new.peek().map(|c| c.object_id);
        match (next_old, next_new) {
            (Some(o), Some(n)) if o < n => merged.extend(old.next()),
            (Some(o), Some(n)) if o == n => {
                old.next();
                merged.extend(new.next());
            }
            (_, Some(_)) => merged.extend(new.next()),
            (Some(_), None) => merged.extend(old.next()),
            (None, None) => break,
        }
    }

    *collections = merged;
}

/// Return the blocks of every rewritten object to the heap and drop them
fn release_blocks(directory: &mut ArchiveDirectory, commits: &[PendingCommit]) {
    for commit in commits {
        let range = directory.block_range(commit.object_id);
        for block in &directory.blocks[range.clone()] {
            let freed = match u32::try_from(block.padded_size()) {
                Ok(size) => directory.heap.deallocate(block.start, size),
                Err(_) => Err(ArchiveError::InvalidHeapRange {
                    offset: block.start,
                    size: block.size,
                }),
            };
            if let Err(e) = freed {
                warn!(
                    "Skipping release of block for object {:#x}: {}",
                    block.object_id, e
                );
            }
        }
        directory.blocks.drain(range);
    }
}

/// Allocate space for every commit with binary data and record its blocks
///
/// Larger objects are placed first so they get first pick of the free spans.
fn place_commits(directory: &mut ArchiveDirectory, commits: &[PendingCommit]) -> Result<Vec<Placement>> {
    let mut order: Vec<usize> = (0..commits.len())
        .filter(|&i| commits[i].total_binary_size > 0)
        .collect();
    order.sort_by(|&a, &b| {
        commits[b]
            .total_binary_size
            .cmp(&commits[a].total_binary_size)
            .then(commits[a].object_id.cmp(&commits[b].object_id))
    });

    let mut placements = Vec::with_capacity(order.len());
    for index in order {
        let commit = &commits[index];
        let size = commit.total_binary_size;

        let allocated_before = directory.heap.allocated_space();
        let heap_size_before = directory.heap.heap_size();
        let offset = directory.heap.allocate_or_grow(size)?;
        debug_assert!(directory.heap.allocated_space() >= allocated_before + size);
        debug_assert!(directory.heap.heap_size() >= heap_size_before);
        debug_assert!(directory.blocks.iter().all(|b| {
            let range = b.padded_range();
            range.end <= offset as u64 || range.start >= offset as u64 + size as u64
        }));

        let mut cursor = offset;
        let run: Vec<ArtifactBlock> = commit
            .binary_artifacts()
            .map(|artifact| {
                let len = artifact.data.len() as u32;
                let block = ArtifactBlock {
                    object_id: commit.object_id,
                    chunk_type_code: artifact.chunk_type_code,
                    version: artifact.version,
                    start: cursor,
                    size: len,
                };
                cursor += padded_size(len) as u32;
                block
            })
            .collect();

        let at = directory
            .blocks
            .partition_point(|b| b.object_id < commit.object_id);
        directory.blocks.splice(at..at, run);

        debug!(
            "Placed object {:#x} at offset {} ({} bytes)",
            commit.object_id, offset, size
        );
        placements.push(Placement {
            commit: index,
            offset,
        });
    }

    placements.sort_by_key(|p| p.offset);
    Ok(placements)
}

/// Write the binary artifacts of every placed commit; returns bytes written
fn write_data_file(
    storage: &dyn Storage,
    path: &Path,
    commits: &[PendingCommit],
    placements: &[Placement],
) -> Result<u64> {
    let mut file = storage.open_or_create(path)?;
    let mut buffer = Vec::new();
    let mut written = 0u64;

    for placement in placements {
        buffer.clear();
        for artifact in commits[placement.commit].binary_artifacts() {
            buffer.extend_from_slice(&artifact.data);
            let padding = padding_for(artifact.data.len() as u32);
            buffer.resize(buffer.len() + padding, PADDING_BYTE);
        }

        file.seek(SeekFrom::Start(placement.offset as u64))?;
        file.write_all(&buffer)?;
        written += buffer.len() as u64;
    }

    file.flush()?;
    file.sync()?;
    Ok(written)
}

/// Merge metrics and log text plus display names into the `.debug` table
fn update_debug_strings(storage: &dyn Storage, path: &Path, commits: &[PendingCommit]) -> Result<()> {
    let mut table = load_debug_strings(storage, path)?;

    for commit in commits {
        let mut has_attached = false;
        for artifact in &commit.artifacts {
            let suffix = match artifact.chunk_type_code {
                CHUNK_TYPE_METRICS => "-metrics",
                CHUNK_TYPE_LOG => "-log",
                _ => continue,
            };
            table.insert(
                format!("{}{}", commit.display_name, suffix),
                String::from_utf8_lossy(&artifact.data).into_owned(),
            );
            has_attached = true;
        }
        if has_attached {
            table.insert(object_key(commit.object_id), commit.display_name.clone());
        }
    }

    if table.is_empty() {
        return Ok(());
    }

    let mut file = storage.create(path)?;
    file.write_all(text_table::write_table(&table).as_bytes())?;
    file.sync()?;
    Ok(())
}

/// Replace the dependency entries of every flushed object in the `.deps` table
fn update_dependencies(storage: &dyn Storage, path: &Path, commits: &[PendingCommit]) -> Result<()> {
    let mut table = load_dependency_table(storage, path)?;

    for commit in commits {
        let files = commit.dep_val.files();
        if files.is_empty() {
            table.remove(&commit.object_id);
        } else {
            table.insert(commit.object_id, files.to_vec());
        }
    }

    let mut file = storage.create(path)?;
    file.write_all(depval::write_dependency_table(&table).as_bytes())?;
    file.sync()?;
    Ok(())
}
