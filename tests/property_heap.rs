//! Property-based tests for block placement
//!
//! Uses proptest to check that repeated flushes with size-changing updates
//! never produce overlapping or misaligned blocks.

use archive_cache::core::directory::ArchiveDirectory;
use archive_cache::{
    ArchiveCache, Artifact, ArtifactRequest, AssetState, CacheConfig, MemoryStorage,
    SpanAllocator, SpanningHeap, Storage,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn load_directory(storage: &MemoryStorage) -> ArchiveDirectory {
    let mut file = storage.open_read(Path::new("prop.dir")).unwrap();
    ArchiveDirectory::load(&mut file).unwrap()
}

/// Object id, then one size per artifact
fn update_strategy() -> impl Strategy<Value = (u64, Vec<usize>)> {
    (0u64..12, prop::collection::vec(1usize..200, 1..4))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_blocks_never_overlap(
        rounds in prop::collection::vec(prop::collection::vec(update_strategy(), 1..6), 1..8)
    ) {
        let storage = MemoryStorage::new();
        let cache = Arc::new(ArchiveCache::new(
            Some(Arc::new(storage.clone())),
            "prop",
            CacheConfig::default(),
        ));
        let mut expected: HashMap<u64, Vec<usize>> = HashMap::new();

        for round in &rounds {
            for (object_id, sizes) in round {
                let artifacts = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, &size)| Artifact::new(0x100 + i as u64, 1, format!("Part{}", i), vec![*object_id as u8; size]))
                    .collect();
                cache
                    .commit(*object_id, format!("obj{}", object_id), artifacts, AssetState::Ready, Vec::new(), None)
                    .unwrap();
                expected.insert(*object_id, sizes.clone());
            }
            cache.flush_to_disk().unwrap();

            let directory = load_directory(&storage);
            let data = storage.contents("prop").unwrap();

            let mut ranges: Vec<_> = directory.blocks.iter().map(|b| b.padded_range()).collect();
            ranges.sort_by_key(|r| r.start);
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
            }

            for block in &directory.blocks {
                prop_assert_eq!(block.start % 8, 0);
                prop_assert!(directory.heap.is_allocated(block.start, block.padded_size() as u32));
                let end = block.start as usize + block.size as usize;
                let padded_end = block.start as usize + block.padded_size() as usize;
                prop_assert!(data[block.start as usize..end].iter().all(|&b| b == block.object_id as u8));
                prop_assert!(data[end..padded_end].iter().all(|&b| b == 0xDD));
            }

            let used: u64 = directory.blocks.iter().map(|b| b.padded_size()).sum();
            prop_assert_eq!(used, directory.heap.allocated_space() as u64);
        }

        let reader = Arc::new(ArchiveCache::new(
            Some(Arc::new(storage.clone())),
            "prop",
            CacheConfig::default(),
        ));
        for (object_id, sizes) in &expected {
            let collection = reader.try_open_from_cache(*object_id).unwrap();
            let requests: Vec<_> = (0..sizes.len())
                .map(|i| ArtifactRequest::new(format!("Part{}", i), 0x100 + i as u64))
                .collect();
            let resolved = collection.resolve_requests(&requests).unwrap();
            for (artifact, &size) in resolved.iter().zip(sizes) {
                prop_assert_eq!(artifact.bytes().map(|b| b.len()), Some(size));
            }
        }
    }

    #[test]
    fn prop_heap_flatten_restore(
        ops in prop::collection::vec((1u32..64, any::<bool>()), 1..40)
    ) {
        let mut heap = SpanningHeap::new();
        let mut live: Vec<(u32, u32)> = Vec::new();

        for (size, free_one) in ops {
            let size = size * 8;
            let offset = heap.allocate_or_grow(size).unwrap();
            live.push((offset, size));
            if free_one && live.len() > 1 {
                let (offset, size) = live.remove(live.len() / 2);
                heap.deallocate(offset, size).unwrap();
            }
        }

        let restored = SpanningHeap::restore(&heap.flatten()).unwrap();
        prop_assert_eq!(&restored, &heap);
        for &(offset, size) in &live {
            prop_assert!(restored.is_allocated(offset, size));
        }
        let live_total: u32 = live.iter().map(|&(_, size)| size).sum();
        prop_assert_eq!(restored.allocated_space(), live_total);
    }
}
