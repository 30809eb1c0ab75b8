use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use stratus_core::{CacheKey, CacheResultBuilder, KeyCodec};

fn codec() -> KeyCodec {
    KeyCodec::new("aws")
        .with_namespace("instances", &["instanceId"])
        .with_namespace("serverGroups", &["cluster", "serverGroup"])
}

fn bench_key_codec(c: &mut Criterion) {
    let codec = codec();
    let encoded = codec
        .build("serverGroups", "prod:main", "us-east-1", &["app%main", "app-main-v001"])
        .unwrap_or_default();

    c.bench_function("key/build", |b| {
        b.iter(|| {
            let key = codec.build(
                black_box("instances"),
                black_box("prod"),
                black_box("us-east-1"),
                &[black_box("i-0123456789abcdef0")],
            );
            black_box(key.is_ok());
        });
    });

    c.bench_function("key/parse_escaped", |b| {
        b.iter(|| {
            let key = CacheKey::parse(black_box(&encoded));
            black_box(key.is_ok());
        });
    });
}

fn bench_accumulator(c: &mut Criterion) {
    c.bench_function("result/accumulate_1k", |b| {
        b.iter(|| {
            let mut builder = CacheResultBuilder::new();
            for i in 0..1_000 {
                let id = format!("aws:instances:prod:us-east-1:i-{i}");
                builder
                    .namespace("instances")
                    .keep(&id)
                    .attribute("state", "running")
                    .relationship("serverGroups", format!("sg-{}", i % 10));
            }
            black_box(builder.build().keep_count());
        });
    });
}

criterion_group!(benches, bench_key_codec, bench_accumulator);
criterion_main!(benches);
