use archive_cache::{SpanAllocator, SpanningHeap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn bench_append_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("spanning_heap_append");

    for count in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("blocks", count), &count, |b, &count| {
            b.iter(|| {
                let mut heap = SpanningHeap::new();
                for i in 0..count {
                    black_box(heap.allocate_or_grow(((i % 32) + 1) * 8).unwrap());
                }
                heap
            });
        });
    }
    group.finish();
}

fn bench_fragmented_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("spanning_heap_reuse");

    for count in [100, 1_000, 5_000] {
        // Heap with every other block free
        let mut heap = SpanningHeap::new();
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let size = ((i % 16) as u32 + 1) * 8;
            blocks.push((heap.allocate_or_grow(size).unwrap(), size));
        }
        for (offset, size) in blocks.iter().step_by(2) {
            heap.deallocate(*offset, *size).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("free_spans", count / 2), &heap, |b, heap| {
            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| {
                let mut heap = heap.clone();
                for _ in 0..64 {
                    let size = rng.gen_range(1..16u32) * 8;
                    black_box(heap.allocate_or_grow(size).unwrap());
                }
                heap
            });
        });
    }
    group.finish();
}

fn bench_flatten_restore(c: &mut Criterion) {
    let mut heap = SpanningHeap::new();
    let mut blocks = Vec::new();
    for i in 0..10_000u32 {
        let size = ((i % 8) + 1) * 8;
        blocks.push((heap.allocate_or_grow(size).unwrap(), size));
    }
    for (offset, size) in blocks.iter().step_by(3) {
        heap.deallocate(*offset, *size).unwrap();
    }
    let flattened = heap.flatten();

    c.bench_function("spanning_heap_flatten", |b| b.iter(|| black_box(heap.flatten())));
    c.bench_function("spanning_heap_restore", |b| {
        b.iter(|| SpanningHeap::restore(black_box(&flattened)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_append_only,
    bench_fragmented_reuse,
    bench_flatten_restore
);
criterion_main!(benches);
