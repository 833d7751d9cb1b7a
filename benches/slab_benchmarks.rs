use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nilstore_core::{encode, plan_range_chunks, Blake3Engine, EngineClient, SlabBuilder, UNIT_CAPACITY};
use tokio::runtime::Runtime;

/// Benchmark: scalar packing of raw bytes into units
fn bench_unit_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("unit_encode");
    for size in [4 * 1024, 1024 * 1024, UNIT_CAPACITY] {
        let data = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(encode(data)));
        });
    }
    group.finish();
}

/// Benchmark: full slab build through the engine worker
fn bench_slab_build(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = rt.block_on(async { EngineClient::spawn(Blake3Engine::new()).unwrap() });
    let builder = SlabBuilder::new(engine);

    let mut group = c.benchmark_group("slab_build");
    group.sample_size(10);
    for size in [64 * 1024, 2 * UNIT_CAPACITY] {
        let data = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.to_async(&rt).iter(|| async {
                black_box(builder.build_bytes("bench.bin", data).await.unwrap())
            });
        });
    }
    group.finish();
}

/// Benchmark: range chunk planning for large reads
fn bench_range_planning(c: &mut Criterion) {
    c.bench_function("plan_range_64mib", |b| {
        b.iter(|| {
            black_box(plan_range_chunks(0, 1 << 30, 12_345, 64 * 1024 * 1024).unwrap())
        });
    });
}

criterion_group!(benches, bench_unit_encoding, bench_slab_build, bench_range_planning);
criterion_main!(benches);
