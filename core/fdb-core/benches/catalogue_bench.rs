// 카탈로그 성능 벤치마크
//
// Section 1: 아카이브 + flush (세그먼트 / KV 엔진)
// Section 2: 조회 (새 리더, 축 사전 검사)
// Section 3: TOC 재생 (인덱스 세그먼트 수에 따른 비용)

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fdb_core::index::KvRegistry;
use fdb_core::{EngineKind, Fdb, FdbConfig, Key, Request, RootConfig, SchemaRegistry};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const SCHEMA: &str = "step: Step;\n[ class, expver [ type, levtype [ step, param ]]]";

fn setup(dir: &Path, engine: EngineKind) -> FdbConfig {
    let schema_path = dir.join("schema");
    fs::write(&schema_path, SCHEMA).unwrap();
    FdbConfig {
        roots: vec![RootConfig::new(dir.join("root"))],
        schema_path,
        engine,
        ..FdbConfig::default()
    }
}

fn open(config: &FdbConfig) -> Fdb {
    Fdb::with_registries(
        config.clone(),
        Arc::new(SchemaRegistry::new()),
        Arc::new(KvRegistry::new()),
    )
    .unwrap()
}

fn key(step: u64, param: &str) -> Key {
    Key::from_pairs([
        ("class", "od"),
        ("expver", "0001"),
        ("type", "fc"),
        ("levtype", "sfc"),
        ("step", step.to_string().as_str()),
        ("param", param),
    ])
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 1: 아카이브 벤치마크
// ═══════════════════════════════════════════════════════════════════════════

fn bench_archive(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive");
    let payload = vec![0u8; 4096];

    for engine in [EngineKind::Toc, EngineKind::Kv] {
        group.bench_function(BenchmarkId::new("100_fields_flush", engine.as_str()), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let config = setup(dir.path(), engine);
                    (open(&config), dir)
                },
                |(fdb, _dir)| {
                    for step in 0..100 {
                        fdb.archive(black_box(&key(step, "t")), &payload).unwrap();
                    }
                    fdb.flush().unwrap();
                },
                BatchSize::PerIteration,
            )
        });
    }

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 2: 조회 벤치마크
// ═══════════════════════════════════════════════════════════════════════════

fn bench_retrieve(c: &mut Criterion) {
    let mut group = c.benchmark_group("retrieve");
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), EngineKind::Toc);

    let writer = open(&config);
    for step in 0..240 {
        writer.archive(&key(step, "t"), b"field").unwrap();
        if step % 24 == 23 {
            writer.flush().unwrap();
        }
    }
    writer.close().unwrap();

    let reader = open(&config);
    let single = Request::from(&key(120, "t"));
    group.bench_function("single_field", |b| {
        b.iter(|| reader.retrieve(black_box(&single)).unwrap())
    });

    let steps: Vec<String> = (0..240).step_by(6).map(|s| s.to_string()).collect();
    let mut many = Request::parse("class=od,expver=0001,type=fc,levtype=sfc,param=t").unwrap();
    many.set_values("step", steps);
    group.bench_function("forty_steps", |b| {
        b.iter(|| reader.retrieve(black_box(&many)).unwrap())
    });

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 3: TOC 재생 벤치마크
// ═══════════════════════════════════════════════════════════════════════════

fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("toc_replay");

    for segments in [1u64, 10, 50] {
        let dir = TempDir::new().unwrap();
        let config = setup(dir.path(), EngineKind::Toc);
        let writer = open(&config);
        for segment in 0..segments {
            for param in ["t", "u", "v"] {
                writer.archive(&key(segment, param), b"x").unwrap();
            }
            writer.flush().unwrap();
        }
        writer.close().unwrap();

        let reader = open(&config);
        group.bench_with_input(BenchmarkId::new("list", segments), &segments, |b, _| {
            b.iter(|| reader.list(black_box(&Request::new())).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_archive, bench_retrieve, bench_list);
criterion_main!(benches);
