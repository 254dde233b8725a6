//! Benchmarks for payload codecs and the offline write path
//!
//! Run with: cargo bench -p schoolsync-core

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use schoolsync_core::codec::compress_verified;
use schoolsync_core::{
    Codec, OfflineConfig, OfflineCoordinator, Priority, TokenCodec, UnconfiguredRemote, ZstdCodec,
};
use serde_json::{json, Value};

fn attendance_sheet(students: usize) -> Value {
    let rows: Vec<Value> = (0..students)
        .map(|i| {
            json!({
                "studentId": format!("ZM-{:05}", i),
                "present": i % 7 != 0,
                "date": "2024-03-11",
                "classId": "grade-7b",
                "teacherId": "T-0031",
            })
        })
        .collect();
    json!({ "rows": rows })
}

// ============================================================================
// Codec Benchmarks
// ============================================================================

fn bench_compress(c: &mut Criterion) {
    let codecs: Vec<(&str, Box<dyn Codec>)> = vec![
        ("token", Box::new(TokenCodec)),
        ("zstd", Box::new(ZstdCodec::default())),
    ];

    for (name, codec) in &codecs {
        let mut group = c.benchmark_group(format!("compress_{}", name));
        for students in [1usize, 40, 400] {
            let payload = attendance_sheet(students);
            group.throughput(Throughput::Elements(students as u64));
            group.bench_with_input(BenchmarkId::from_parameter(students), &payload, |b, p| {
                b.iter(|| black_box(codec.compress(p).unwrap()))
            });
        }
        group.finish();
    }
}

fn bench_decompress(c: &mut Criterion) {
    let payload = attendance_sheet(40);
    let token = TokenCodec.compress(&payload).unwrap();
    let zstd = ZstdCodec::default().compress(&payload).unwrap();

    let mut group = c.benchmark_group("decompress_40_students");
    group.bench_function("token", |b| {
        b.iter(|| black_box(TokenCodec.decompress(&token).unwrap()))
    });
    group.bench_function("zstd", |b| {
        b.iter(|| black_box(ZstdCodec::default().decompress(&zstd).unwrap()))
    });
    group.finish();
}

fn bench_verified_compress(c: &mut Criterion) {
    let payload = attendance_sheet(40);
    c.bench_function("compress_verified_token_40", |b| {
        b.iter(|| black_box(compress_verified(&TokenCodec, &payload)))
    });
}

// ============================================================================
// Write Path Benchmarks
// ============================================================================

fn bench_store_offline(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let coordinator = OfflineCoordinator::in_memory(
        OfflineConfig::default().with_start_online(false),
        Arc::new(UnconfiguredRemote),
    )
    .unwrap();
    let payload = json!({"studentId": "ZM-00042", "present": true, "date": "2024-03-11"});

    c.bench_function("store_offline_data_memory", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                coordinator
                    .store_offline_data("attendance", payload.clone(), Priority::Normal)
                    .await
                    .unwrap(),
            )
        })
    });
}

criterion_group!(codec_benches, bench_compress, bench_decompress, bench_verified_compress,);

criterion_group!(write_benches, bench_store_offline,);

criterion_main!(codec_benches, write_benches);
