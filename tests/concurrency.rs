//! Concurrent commit, flush and read stress tests

use archive_cache::{
    ArchiveCache, ArchiveCacheSet, ArchiveError, Artifact, ArtifactRequest, AssetState,
    CacheConfig, DataKind, MemoryStorage, ResolvedArtifact,
};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use std::io::Read;
use std::sync::Arc;

const TYPE_DATA: u64 = 0xD00D;

/// Payloads encode their object id so readers can check what they got
fn payload(object_id: u64, len: usize) -> Vec<u8> {
    vec![object_id as u8; len.max(1)]
}

fn cache_over(storage: &MemoryStorage) -> Arc<ArchiveCache> {
    Arc::new(ArchiveCache::new(
        Some(Arc::new(storage.clone())),
        "stress",
        CacheConfig::default(),
    ))
}

#[test]
fn test_writers_readers_and_flusher() {
    let storage = MemoryStorage::new();
    let cache = cache_over(&storage);

    crossbeam::scope(|s| {
        for writer in 0..4u64 {
            let cache = &cache;
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(writer);
                for _ in 0..200 {
                    let object_id = writer * 16 + rng.gen_range(0..16);
                    let len = rng.gen_range(1..300);
                    cache
                        .commit(
                            object_id,
                            format!("obj{}", object_id),
                            vec![Artifact::new(TYPE_DATA, 1, "Data", payload(object_id, len))],
                            AssetState::Ready,
                            Vec::new(),
                            None,
                        )
                        .unwrap();
                }
            });
        }

        for reader in 0..4u64 {
            let cache = &cache;
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(100 + reader);
                for _ in 0..300 {
                    let object_id = rng.gen_range(0..64);
                    let collection = match cache.try_open_from_cache(object_id) {
                        Some(collection) => collection,
                        None => continue,
                    };
                    let request = ArtifactRequest::new("Data", TYPE_DATA).kind(DataKind::Raw);
                    match collection.resolve_requests(&[request]) {
                        Ok(resolved) => {
                            let bytes = resolved[0].bytes().unwrap();
                            assert!(bytes.iter().all(|&b| b == object_id as u8));
                        }
                        Err(ArchiveError::ConcurrentModification(id)) => assert_eq!(id, object_id),
                        Err(ArchiveError::MissingChunk { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            });
        }

        let cache = &cache;
        s.spawn(move |_| {
            for _ in 0..20 {
                cache.flush_to_disk().unwrap();
                std::thread::yield_now();
            }
        });
    })
    .unwrap();

    cache.flush_to_disk().unwrap();
    assert_eq!(cache.pending_commits(), 0);

    // Everything that was written reads back from a fresh instance
    let reader = cache_over(&storage);
    let metrics = reader.metrics();
    assert!(!metrics.blocks.is_empty());
    for block in &metrics.blocks {
        let resolved = reader
            .try_open_from_cache(block.object_id)
            .unwrap()
            .resolve_requests(&[ArtifactRequest::new("Data", TYPE_DATA)])
            .unwrap();
        let bytes = resolved[0].bytes().unwrap();
        assert!(bytes.iter().all(|&b| b == block.object_id as u8));
    }
}

#[test]
fn test_reopen_after_recommit_detects_change() {
    let storage = MemoryStorage::new();
    let cache = cache_over(&storage);
    cache
        .commit(7, "obj", vec![Artifact::new(TYPE_DATA, 1, "Data", payload(7, 64))], AssetState::Ready, Vec::new(), None)
        .unwrap();
    cache.flush_to_disk().unwrap();

    let collection = cache.try_open_from_cache(7).unwrap();
    let handle = match collection
        .resolve_requests(&[ArtifactRequest::new("Data", TYPE_DATA).kind(DataKind::Reopen)])
        .unwrap()
        .remove(0)
    {
        ResolvedArtifact::Reopen(handle) => handle,
        other => panic!("expected a reopen handle, got {:?}", other),
    };

    let mut first = Vec::new();
    handle.reopen().unwrap().read_to_end(&mut first).unwrap();
    assert_eq!(first, payload(7, 64));

    cache
        .commit(7, "obj", vec![Artifact::new(TYPE_DATA, 1, "Data", payload(7, 8))], AssetState::Ready, Vec::new(), None)
        .unwrap();

    assert!(matches!(handle.reopen(), Err(ArchiveError::ConcurrentModification(7))));
    assert!(matches!(
        collection.resolve_requests(&[ArtifactRequest::new("Data", TYPE_DATA)]),
        Err(ArchiveError::ConcurrentModification(7))
    ));
}

#[test]
fn test_registry_shared_across_threads() {
    let storage = MemoryStorage::new();
    let set = ArchiveCacheSet::new(Some(Arc::new(storage.clone())), CacheConfig::default());

    crossbeam::scope(|s| {
        for thread in 0..8u64 {
            let set = &set;
            s.spawn(move |_| {
                let name = if thread % 2 == 0 { "shared/even" } else { "shared\\odd" };
                set.get_archive(name)
                    .commit(thread, "obj", vec![Artifact::new(TYPE_DATA, 1, "Data", payload(thread, 4))], AssetState::Ready, Vec::new(), None)
                    .unwrap();
            });
        }
    })
    .unwrap();

    assert_eq!(set.len(), 2);
    assert_eq!(set.get_archive("shared/even").pending_commits(), 4);
    assert_eq!(set.get_archive("shared/odd").pending_commits(), 4);

    set.close().unwrap();
    assert!(storage.exists("shared/even.dir"));
    assert!(storage.exists("shared\\odd.dir"));
}
