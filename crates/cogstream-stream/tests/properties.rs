//! Behavioural properties of the default and caching streams.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cogstream_range::{MemoryRangeReader, RangeError, RetryPolicy};
use cogstream_stream::{
    CacheConfig, CachingStream, DefaultStream, RangeStream, StreamConfig, StreamError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BLOCK: u32 = 64;

fn object(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

fn caching_config(block_size: u32, capacity_bytes: u64) -> StreamConfig {
    StreamConfig {
        header_prefetch: 0,
        cache: CacheConfig {
            block_size,
            capacity_bytes,
            max_fetch_size: block_size * 16,
        },
        ..StreamConfig::default()
    }
}

fn caching(data: Vec<u8>, block_size: u32) -> CachingStream {
    CachingStream::open(
        Box::new(MemoryRangeReader::new(data)),
        &caching_config(block_size, u64::MAX),
    )
    .unwrap()
}

#[test]
fn test_cache_is_transparent() {
    let data = object(5_000);
    let cached = caching(data.clone(), BLOCK);
    let direct = DefaultStream::open(
        Box::new(MemoryRangeReader::new(data.clone())),
        &StreamConfig::uncached(),
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let pos = rng.gen_range(0..data.len() as u64);
        let len = rng.gen_range(0..=(data.len() as u64 - pos).min(700)) as usize;
        assert_eq!(
            cached.read_bytes(pos, len).unwrap(),
            direct.read_bytes(pos, len).unwrap(),
            "pos={pos} len={len}"
        );
    }
}

#[test]
fn test_concurrent_identical_reads_fetch_once() {
    const THREADS: usize = 8;
    let data = object(4_096);
    let reader = MemoryRangeReader::new(data.clone()).with_latency(Duration::from_millis(50));
    let probe = reader.probe();
    let stream = Arc::new(
        CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let stream = Arc::clone(&stream);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                stream.read_bytes(100, 200).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(&handle.join().unwrap()[..], &data[100..300]);
    }
    assert_eq!(probe.calls(), 1);
    assert_eq!(stream.cache_stats().unwrap().fetches, 1);
}

#[test]
fn test_overlapping_concurrent_reads_claim_each_block_once() {
    let data = object(64 * 40);
    let reader = MemoryRangeReader::new(data.clone()).with_latency(Duration::from_millis(5));
    let stream = Arc::new(
        CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap(),
    );

    let handles: Vec<_> = (0..6u64)
        .map(|seed| {
            let stream = Arc::clone(&stream);
            let data = data.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut touched = HashSet::new();
                for _ in 0..40 {
                    let pos = rng.gen_range(0..data.len() as u64 - 1);
                    let len = rng.gen_range(1..=(data.len() as u64 - pos).min(300));
                    let bytes = stream.read_bytes(pos, len as usize).unwrap();
                    assert_eq!(&bytes[..], &data[pos as usize..(pos + len) as usize]);
                    touched.extend(pos / BLOCK as u64..=(pos + len - 1) / BLOCK as u64);
                }
                touched
            })
        })
        .collect();

    let mut touched = HashSet::new();
    for handle in handles {
        touched.extend(handle.join().unwrap());
    }
    let stats = stream.cache_stats().unwrap();
    assert_eq!(stats.misses, touched.len() as u64);
    assert_eq!(stats.resident_blocks, touched.len() as u64);
}

#[test]
fn test_repeat_read_does_not_refetch() {
    let reader = MemoryRangeReader::new(object(2_000));
    let probe = reader.probe();
    let stream = CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap();

    let first = stream.read_bytes(123, 456).unwrap();
    let second = stream.read_bytes(123, 456).unwrap();
    assert_eq!(first, second);
    assert_eq!(probe.calls(), 1);
}

#[test]
fn test_split_and_merged_reads_agree() {
    let data = object(700);
    let n = 500u64;
    for k in 1..n {
        let stream = caching(data.clone(), BLOCK);
        let whole = stream.read_bytes(0, n as usize).unwrap();

        let fresh = caching(data.clone(), BLOCK);
        let mut joined = fresh.read_bytes(0, k as usize).unwrap().to_vec();
        joined.extend_from_slice(&fresh.read_bytes(k, (n - k) as usize).unwrap());
        assert_eq!(&whole[..], &joined[..], "k={k}");
    }
}

#[test]
fn test_cross_block_copies_stay_in_bounds() {
    // Uneven final block: 8 full blocks of 16 bytes plus 5.
    let block = 16u32;
    let data = object(block as usize * 8 + 5);
    let total = data.len() as u64;

    for span_blocks in 1..=5u64 {
        for pos in 0..(block as u64 * 3) {
            for len in [
                span_blocks * block as u64 - 1,
                span_blocks * block as u64,
                span_blocks * block as u64 + 1,
            ] {
                if len == 0 || pos + len > total {
                    continue;
                }
                let stream = caching(data.clone(), block);
                let mut buf = vec![0xAAu8; len as usize];
                stream.read_at(pos, &mut buf).unwrap();
                assert_eq!(
                    &buf[..],
                    &data[pos as usize..(pos + len) as usize],
                    "pos={pos} len={len}"
                );
            }
        }
    }

    // Reads ending exactly at, and running past, the short final block.
    let stream = caching(data.clone(), block);
    let tail = stream.read_bytes(total - 21, 21).unwrap();
    assert_eq!(&tail[..], &data[data.len() - 21..]);
    assert!(matches!(
        stream.read_bytes(total - 3, 4),
        Err(StreamError::Range(RangeError::UnexpectedEof { .. }))
    ));
}

#[test]
fn test_cache_stays_within_capacity() {
    let data = object(BLOCK as usize * 10);
    let reader = MemoryRangeReader::new(data.clone());
    let probe = reader.probe();
    let capacity = BLOCK as u64 * 3;
    let stream = CachingStream::open(Box::new(reader), &caching_config(BLOCK, capacity)).unwrap();

    for index in 0..10u64 {
        stream.read_bytes(index * BLOCK as u64, BLOCK as usize).unwrap();
        // The blocks of the read in progress may briefly sit above capacity.
        assert!(stream.cache_stats().unwrap().resident_bytes <= capacity + BLOCK as u64);
    }
    assert!(stream.cache_stats().unwrap().evictions >= 6);

    probe.reset();
    assert_eq!(&stream.read_bytes(0, 8).unwrap()[..], &data[..8]);
    assert_eq!(probe.calls(), 1, "evicted block must be fetched again");
}

#[test]
fn test_missing_object_is_permanent_after_one_call() {
    let reader = MemoryRangeReader::missing("mem://missing.tif").with_retry(RetryPolicy::immediate(5));
    let probe = reader.probe();
    let err = CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap_err();
    assert!(!err.is_transient());
    assert!(matches!(err, StreamError::Range(RangeError::NotFound(_))));
    assert_eq!(probe.length_calls() + probe.calls(), 1);
}

#[test]
fn test_permanent_fetch_failure_is_not_retried() {
    let reader = MemoryRangeReader::new(object(1_000)).with_retry(RetryPolicy::immediate(5));
    let probe = reader.probe();
    reader.fail_next(RangeError::AccessDenied("mem://object".into()));
    let stream = CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap();

    let err = stream.read_bytes(0, 10).unwrap_err();
    assert!(!err.is_transient());
    assert!(matches!(err.range_error(), Some(RangeError::AccessDenied(_))));
    assert_eq!(probe.calls(), 1);
}

#[test]
fn test_transient_failures_recover_within_budget() {
    let data = object(1_000);
    let reader = MemoryRangeReader::new(data.clone()).with_retry(RetryPolicy::immediate(3));
    let probe = reader.probe();
    for _ in 0..2 {
        reader.fail_next(RangeError::Status {
            status: 503,
            location: "mem://object".into(),
        });
    }
    let stream = CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap();

    assert_eq!(&stream.read_bytes(10, 100).unwrap()[..], &data[10..110]);
    assert_eq!(probe.calls(), 3);
    assert_eq!(stream.reader_stats().retries, 2);
}

#[test]
fn test_waiters_share_the_fetch_failure() {
    const THREADS: usize = 4;
    let reader = MemoryRangeReader::new(object(1_000))
        .with_retry(RetryPolicy::none())
        .with_latency(Duration::from_millis(200));
    let probe = reader.probe();
    reader.fail_next(RangeError::AccessDenied("mem://object".into()));
    let stream = Arc::new(
        CachingStream::open(Box::new(reader), &caching_config(BLOCK, u64::MAX)).unwrap(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let stream = Arc::clone(&stream);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                stream.read_bytes(0, 32)
            })
        })
        .collect();

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err.range_error(), Some(RangeError::AccessDenied(_))));
    }
    assert_eq!(probe.calls(), 1);

    // The failed claim was removed: a new read fetches again and succeeds.
    assert!(stream.read_bytes(0, 32).is_ok());
    assert_eq!(probe.calls(), 2);
}
