use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use segalloc::Segalloc;

const OPS: u64 = 100_000;

/// segalloc alloc/free throughput.
fn segalloc_malloc_free(alloc: &Segalloc, size: usize) {
    for _ in 0..OPS {
        let ptr = alloc.malloc(size);
        black_box(ptr);
        unsafe { alloc.free(ptr) };
    }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
    let alloc = Segalloc::new();
    assert_eq!(alloc.init(), 0);

    let mut group = c.benchmark_group("malloc_throughput");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("segalloc", size), &size, |b, &size| {
            b.iter(|| segalloc_malloc_free(&alloc, size))
        });

        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
