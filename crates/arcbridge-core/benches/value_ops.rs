use arcbridge_core::{RawValue, Type, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_construct(c: &mut Criterion) {
    let mut group = c.benchmark_group("construct");

    for size in [16usize, 256, 4096] {
        let items: Vec<RawValue> = (0..size as i64).map(RawValue::Int).collect();
        let raw = RawValue::Array(items);
        let ty = Type::array(Type::Int32.into_ref());
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("array_int32", size), &raw, |b, raw| {
            b.iter(|| Value::new(ty.clone(), black_box(raw.clone())).unwrap());
        });
    }

    let ty = Type::named_tuple(vec![
        ("id", Type::Int32.into_ref()),
        ("name", Type::String.into_ref()),
        ("score", Type::Float64.into_ref()),
    ]);
    let raw = RawValue::Hash(vec![
        (RawValue::symbol("id"), 1.into()),
        (RawValue::symbol("name"), "bench".into()),
        (RawValue::symbol("score"), 0.5.into()),
    ]);
    group.bench_function("named_tuple", |b| {
        b.iter(|| Value::new(ty.clone(), black_box(raw.clone())).unwrap());
    });

    group.finish();
}

fn bench_copy(c: &mut Criterion) {
    let ty = Type::array(Type::String.into_ref());
    let raw = RawValue::Array((0..256).map(|i| RawValue::from(format!("item-{}", i))).collect());
    let value = Value::new(ty, raw).unwrap();

    c.bench_function("dup", |b| b.iter(|| black_box(value.dup())));
    c.bench_function("deep_dup", |b| b.iter(|| value.deep_dup().unwrap()));
    c.bench_function("to_native", |b| b.iter(|| black_box(value.to_native())));
}

fn bench_access(c: &mut Criterion) {
    let ty = Type::hash(Type::Int32.into_ref(), Type::Int32.into_ref());
    let raw = RawValue::Hash((0..64).map(|i| (i.into(), (i * 2).into())).collect());
    let map = Value::new(ty, raw).unwrap();

    c.bench_function("hash_lookup", |b| b.iter(|| map.lookup(black_box(63)).unwrap()));

    let list = Value::new(Type::array(Type::Int64.into_ref()), vec![0i64; 1024]).unwrap();
    c.bench_function("array_at", |b| b.iter(|| list.at(black_box(-1)).unwrap()));
}

criterion_group!(benches, bench_construct, bench_copy, bench_access);
criterion_main!(benches);
