//! Benchmarks for cached and uncached stream reads.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cogstream_range::MemoryRangeReader;
use cogstream_stream::{CachingStream, DefaultStream, RangeStream, StreamConfig};

const OBJECT_LEN: usize = 8 * 1024 * 1024;

fn object() -> Vec<u8> {
    (0..OBJECT_LEN).map(|i| (i % 251) as u8).collect()
}

fn bench_uncached_reads(c: &mut Criterion) {
    let stream = DefaultStream::open(
        Box::new(MemoryRangeReader::new(object())),
        &StreamConfig::uncached(),
    )
    .unwrap();
    let mut buf = vec![0u8; 16 * 1024];

    c.bench_function("default_read_16kb_stride", |b| {
        b.iter(|| {
            for offset in (0..OBJECT_LEN as u64 - 16 * 1024).step_by(512 * 1024) {
                stream.read_at(black_box(offset), &mut buf).unwrap();
            }
            black_box(&buf);
        })
    });
}

fn bench_cached_reads(c: &mut Criterion) {
    let stream = CachingStream::open(
        Box::new(MemoryRangeReader::new(object())),
        &StreamConfig::default(),
    )
    .unwrap();
    let mut buf = vec![0u8; 16 * 1024];

    // Warm every block once so the loop measures hits only.
    stream.read_at(0, &mut vec![0u8; OBJECT_LEN]).unwrap();

    c.bench_function("caching_read_16kb_stride_warm", |b| {
        b.iter(|| {
            for offset in (0..OBJECT_LEN as u64 - 16 * 1024).step_by(512 * 1024) {
                stream.read_at(black_box(offset), &mut buf).unwrap();
            }
            black_box(&buf);
        })
    });
}

fn bench_cold_cache_fill(c: &mut Criterion) {
    let data = object();
    let mut buf = vec![0u8; 1024 * 1024];

    c.bench_function("caching_cold_read_1mb", |b| {
        b.iter(|| {
            let stream = CachingStream::open(
                Box::new(MemoryRangeReader::new(data.clone())),
                &StreamConfig::default(),
            )
            .unwrap();
            stream.read_at(black_box(2 * 1024 * 1024), &mut buf).unwrap();
            black_box(stream.cache_stats());
        })
    });
}

criterion_group!(
    benches,
    bench_uncached_reads,
    bench_cached_reads,
    bench_cold_cache_fill,
);
criterion_main!(benches);
