use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use stepstream::format::{copy_selection, WireDeserializer, WireSerializer};
use stepstream::types::BlockLayout;
use stepstream::{DataType, OperatorRegistry, Params, Variable};

fn field(side: u64) -> (Variable, Vec<f64>) {
    let var = Variable::global(
        "field",
        DataType::Double,
        vec![side, side],
        vec![0, 0],
        vec![side, side],
    )
    .unwrap();
    let values = (0..side * side).map(|i| i as f64 * 0.5).collect();
    (var, values)
}

fn pack(var: &Variable, values: &[f64], steps: u64) -> bytes::Bytes {
    let mut serializer = WireSerializer::new(0, Arc::new(OperatorRegistry::with_defaults()));
    serializer.new_buffer();
    for step in 0..steps {
        serializer.put_values(var, step, values).unwrap();
        serializer.attach_timestamp(step);
    }
    serializer.get_local_pack()
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");

    for side in [64u64, 256, 1024].iter() {
        let (var, values) = field(*side);
        group.throughput(Throughput::Bytes(var.payload_size() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), side, |b, _| {
            b.iter(|| pack(black_box(&var), black_box(&values), 1));
        });
    }
    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("deserialize");

    for steps in [1u64, 8, 32].iter() {
        let (var, values) = field(128);
        let message = pack(&var, &values, *steps);
        group.throughput(Throughput::Bytes(message.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(steps), steps, |b, _| {
            b.iter(|| {
                let deserializer = WireDeserializer::new();
                deserializer.put(black_box(message.clone())).unwrap();
                deserializer
            });
        });
    }
    group.finish();
}

fn bench_compressed_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize_compressed");

    for id in ["zstd", "lz4"].iter() {
        let (mut var, values) = field(256);
        var.set_operator(*id, Params::new());
        group.throughput(Throughput::Bytes(var.payload_size() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(id), id, |b, _| {
            b.iter(|| pack(black_box(&var), black_box(&values), 1));
        });
    }
    group.finish();
}

fn bench_copy_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_selection");
    let side = 512u64;
    let (var, values) = field(side);
    let mut src = Vec::with_capacity(var.payload_size());
    for v in &values {
        src.extend_from_slice(&v.to_ne_bytes());
    }

    for sel in [16u64, 128, 512].iter() {
        let start = vec![(side - sel) / 2; 2];
        let count = vec![*sel, *sel];
        let mut dst = vec![0u8; (sel * sel * 8) as usize];
        group.bench_with_input(BenchmarkId::from_parameter(sel), sel, |b, _| {
            b.iter(|| {
                copy_selection(
                    black_box(&src),
                    &[0, 0],
                    &[side, side],
                    BlockLayout::native(),
                    &mut dst,
                    &start,
                    &count,
                    DataType::Double,
                )
                .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_serialize,
    bench_deserialize,
    bench_compressed_serialize,
    bench_copy_selection
);
criterion_main!(benches);
