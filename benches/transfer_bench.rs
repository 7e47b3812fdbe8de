use bcast::collective::{local_group, Collective};
use bcast::streaming::{ByteSink, ByteSource, TransferSession};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use tokio::runtime::Runtime;

const STREAM_LEN: usize = 16 * 1024 * 1024;

/// Push `data` through a local group of `size`, every member writing to memory.
async fn broadcast_stream(data: &[u8], size: usize, capacity: usize) -> u64 {
    let handles: Vec<_> = local_group(size)
        .into_iter()
        .map(|mut member| {
            let mut source = member
                .is_origin()
                .then(|| ByteSource::new(Cursor::new(data.to_vec())));
            tokio::spawn(async move {
                let mut sink = ByteSink::new(Vec::with_capacity(STREAM_LEN));
                TransferSession::new(capacity)
                    .unwrap()
                    .run(&mut member, source.as_mut(), Some(&mut sink), |_| {})
                    .await
                    .unwrap()
                    .total_bytes
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    total
}

fn bench_group_size(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let data = vec![0x5Au8; STREAM_LEN];

    let mut group = c.benchmark_group("broadcast_group_size");
    group.throughput(Throughput::Bytes(STREAM_LEN as u64));
    group.sample_size(10);

    for size in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| runtime.block_on(broadcast_stream(black_box(&data), size, 1 << 20)));
        });
    }
    group.finish();
}

fn bench_chunk_capacity(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let data = vec![0xA5u8; STREAM_LEN];

    let mut group = c.benchmark_group("broadcast_chunk_capacity");
    group.throughput(Throughput::Bytes(STREAM_LEN as u64));
    group.sample_size(10);

    for capacity in [64 * 1024usize, 1 << 20, 4 << 20] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| runtime.block_on(broadcast_stream(black_box(&data), 4, capacity)));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_group_size, bench_chunk_capacity);
criterion_main!(benches);
