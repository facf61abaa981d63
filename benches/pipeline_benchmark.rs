use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use secure_cryptor_queue::{
    AreaBounds, ConversionConfig, ConversionEngine, ConversionRequest, CryptoContext, EncryptedIoQueue,
    MemoryDevice, MemoryHeaderStore, QueueConfig, XtsCryptoContext, DATA_UNIT_SIZE,
};

const DEVICE_SIZE: usize = 16 * 1024 * 1024;

fn encrypted_queue(fragment_size: usize) -> EncryptedIoQueue {
    let area = AreaBounds::with_length(0, DEVICE_SIZE as u64);
    let config = QueueConfig::filter()
        .with_fragment_size(fragment_size)
        .with_areas(area, area);
    EncryptedIoQueue::start(
        config,
        Arc::new(XtsCryptoContext::random()),
        Arc::new(MemoryDevice::new(DEVICE_SIZE)),
    )
    .unwrap()
}

/// Benchmark raw XTS throughput over whole data units.
fn bench_xts(c: &mut Criterion) {
    let mut group = c.benchmark_group("xts");
    let crypto = XtsCryptoContext::random();

    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size / 1024), &size, |b, &size| {
            let mut buf = vec![0u8; size];
            b.iter(|| {
                crypto
                    .encrypt_data_units(black_box(&mut buf), 0, size / DATA_UNIT_SIZE)
                    .unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark write and read requests through the full pipeline.
fn bench_queue_io(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_io");
    let queue = encrypted_queue(256 * 1024);

    // Spans 4 KiB up to four fragments
    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        let data = vec![0xA5u8; size];

        group.bench_with_input(BenchmarkId::new("write", size / 1024), &size, |b, _| {
            b.iter(|| {
                let completion = queue.write(1024 * 1024, data.clone());
                black_box(completion.status);
            });
        });

        group.bench_with_input(BenchmarkId::new("read", size / 1024), &size, |b, &size| {
            b.iter(|| {
                let completion = queue.read(1024 * 1024, size);
                black_box(completion.data);
            });
        });
    }

    group.finish();
    queue.stop().unwrap();
}

/// Benchmark the effect of the fragment size on a large read.
fn bench_fragment_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment_size");
    let size = 2 * 1024 * 1024;
    group.throughput(Throughput::Bytes(size as u64));

    for fragment_size in [16 * 1024, 64 * 1024, 256 * 1024] {
        let queue = encrypted_queue(fragment_size);
        group.bench_with_input(
            BenchmarkId::from_parameter(fragment_size / 1024),
            &fragment_size,
            |b, _| {
                b.iter(|| black_box(queue.read(0, size).status));
            },
        );
        queue.stop().unwrap();
    }

    group.finish();
}

/// Benchmark a full in-place encryption of a small device.
fn bench_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("conversion");
    let size = 4 * 1024 * 1024;
    group.throughput(Throughput::Bytes(size as u64));
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("encrypt_4MB", |b| {
        b.iter(|| {
            let config = QueueConfig::filter()
                .with_areas(AreaBounds::EMPTY, AreaBounds::with_length(0, size as u64));
            let queue = Arc::new(
                EncryptedIoQueue::start(
                    config,
                    Arc::new(XtsCryptoContext::random()),
                    Arc::new(MemoryDevice::new(size)),
                )
                .unwrap(),
            );
            let engine = ConversionEngine::new(
                queue.clone(),
                Arc::new(MemoryHeaderStore::new()),
                ConversionConfig::default(),
            );
            let outcome = engine.start_conversion(ConversionRequest::encrypt()).unwrap().wait();
            black_box(outcome);
            drop(engine);
            queue.stop().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_xts, bench_queue_io, bench_fragment_size, bench_conversion);
criterion_main!(benches);
