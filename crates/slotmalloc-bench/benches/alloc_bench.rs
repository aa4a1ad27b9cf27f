//! Allocation path benchmarks.
//!
//! Usage:
//! - `cargo bench -p slotmalloc-bench --bench alloc_bench`
//! - `SLOTMALLOC_MODE=hardened cargo bench -p slotmalloc-bench --bench alloc_bench`
//!   (the mode is read once by the process-wide heap)
//!
//! Compares the engine against the host allocator on the same request mix.

use std::ffi::c_void;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use slotmalloc_abi::malloc_abi;
use slotmalloc_core::{Heap, Mode};
use slotmalloc_harness::trace::{GenerateConfig, generate};

const SIZES: [usize; 6] = [16, 64, 256, 1024, 4096, 65_536];

fn bench_alloc_free(c: &mut Criterion) {
    let heap = Heap::new().with_mode(Mode::Strict);
    // Keeps each class's region mapped so the loop measures slot reuse.
    let anchors: Vec<_> = SIZES.iter().filter_map(|&s| heap.allocate(s)).collect();

    let mut group = c.benchmark_group("alloc_free");
    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("slotmalloc", size), &size, |b, &size| {
            b.iter(|| {
                let p = heap.allocate(black_box(size)).expect("alloc");
                // SAFETY: live pointer, freed once.
                unsafe { heap.deallocate(p.as_ptr()) };
            });
        });
        group.bench_with_input(BenchmarkId::new("host", size), &size, |b, &size| {
            b.iter(|| {
                // SAFETY: plain malloc/free pair on the host allocator.
                unsafe {
                    let p = libc::malloc(black_box(size));
                    libc::free(black_box(p));
                }
            });
        });
    }
    group.finish();

    for p in anchors {
        // SAFETY: live anchors, freed once.
        unsafe { heap.deallocate(p.as_ptr()) };
    }
}

fn bench_region_lifecycle(c: &mut Criterion) {
    // Nothing else is live, so every pair maps and unmaps a region.
    let heap = Heap::new().with_mode(Mode::Strict);
    c.bench_function("region_map_unmap_64", |b| {
        b.iter(|| {
            let p = heap.allocate(black_box(64)).expect("alloc");
            // SAFETY: live pointer, freed once.
            unsafe { heap.deallocate(p.as_ptr()) };
        });
    });
}

fn bench_free_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_mode");
    for mode in [Mode::Strict, Mode::Hardened] {
        let heap = Heap::new().with_mode(mode);
        let anchor = heap.allocate(128).expect("anchor");
        group.bench_function(mode.as_str(), |b| {
            b.iter(|| {
                let p = heap.allocate(128).expect("alloc");
                // SAFETY: live pointer, freed once.
                unsafe { heap.deallocate(black_box(p.as_ptr())) };
            });
        });
        // SAFETY: live anchor.
        unsafe { heap.deallocate(anchor.as_ptr()) };
    }
    group.finish();
}

fn bench_zeroed(c: &mut Criterion) {
    let heap = Heap::new().with_mode(Mode::Strict);
    let anchor = heap.allocate(1024).expect("anchor");
    c.bench_function("allocate_zeroed_1024", |b| {
        b.iter(|| {
            let p = heap.allocate_zeroed(black_box(4), 256).expect("alloc");
            // SAFETY: live pointer, freed once.
            unsafe { heap.deallocate(p.as_ptr()) };
        });
    });
    // SAFETY: live anchor.
    unsafe { heap.deallocate(anchor.as_ptr()) };
}

fn bench_resize_growth(c: &mut Criterion) {
    let heap = Heap::new().with_mode(Mode::Strict);
    c.bench_function("resize_16_to_8192", |b| {
        b.iter(|| {
            let mut p = heap.allocate(16).expect("alloc").as_ptr();
            let mut size = 16;
            while size < 8192 {
                size *= 2;
                // SAFETY: p is live; on success the old pointer is released.
                p = unsafe { heap.resize(p, size) }.expect("resize").as_ptr();
            }
            // SAFETY: live pointer, freed once.
            unsafe { heap.deallocate(black_box(p)) };
        });
    });
}

fn bench_c_abi(c: &mut Criterion) {
    c.bench_function("abi_malloc_free_48", |b| {
        b.iter(|| {
            // SAFETY: malloc/free pair through the C entry points.
            unsafe {
                let p: *mut c_void = malloc_abi::malloc(black_box(48));
                malloc_abi::free(black_box(p));
            }
        });
    });
}

fn bench_trace_replay(c: &mut Criterion) {
    let trace = generate(&GenerateConfig {
        seed: 0x5EED,
        ops: 2_000,
        max_live: 128,
        max_large: 32 * 1024,
    });
    let mut group = c.benchmark_group("trace_replay");
    group.throughput(Throughput::Elements(trace.len() as u64));
    for mode in [Mode::Strict, Mode::Hardened] {
        group.bench_function(mode.as_str(), |b| {
            b.iter(|| slotmalloc_harness::replay_isolated(black_box(&trace), mode).expect("replay"));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free,
    bench_region_lifecycle,
    bench_free_modes,
    bench_zeroed,
    bench_resize_growth,
    bench_c_abi,
    bench_trace_replay
);
criterion_main!(benches);
