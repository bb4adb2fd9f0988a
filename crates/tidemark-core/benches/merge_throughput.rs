use std::fs;
use std::io::Cursor;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tidemark_core::{MergeOptions, MergePipeline, SourceInput};

fn fixture_lines(records: usize) -> String {
    let mut out = String::with_capacity(records * 48);
    for i in 0..records {
        // Two interleaved clocks so blocks overlap and the merge has work.
        let ts = (i % 2) as i64 * 500 + (i / 2) as i64;
        let level = match i % 4 {
            0 => "debug",
            1 => "info",
            2 => "warning",
            _ => "error",
        };
        out.push_str(&format!(
            "{{\"ts\":{ts},\"level\":\"{level}\",\"msg\":\"record-{i}\"}}\n"
        ));
    }
    out
}

fn bench_merge(c: &mut Criterion) {
    let content = fixture_lines(20_000);
    let bytes = content.len() as u64;
    let dir = tempfile::tempdir().expect("bench tempdir");
    let path = dir.path().join("bench.log");
    fs::write(&path, &content).expect("bench fixture");

    let options = MergeOptions {
        block_size: 64 * 1024,
        parser_workers: 4,
        formatter_workers: 4,
        ..MergeOptions::default()
    };

    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Bytes(bytes));

    group.bench_function("file_mode", |b| {
        b.iter(|| {
            let pipeline = MergePipeline::new(options.clone());
            let mut sink = Vec::with_capacity(content.len());
            pipeline
                .run(vec![SourceInput::file(&path)], &mut sink)
                .expect("bench merge");
            sink
        })
    });

    group.bench_function("stream_mode", |b| {
        b.iter(|| {
            let pipeline = MergePipeline::new(options.clone());
            let mut sink = Vec::with_capacity(content.len());
            pipeline
                .run(
                    vec![SourceInput::stream(Cursor::new(content.clone().into_bytes()))],
                    &mut sink,
                )
                .expect("bench merge");
            sink
        })
    });

    group.finish();
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
