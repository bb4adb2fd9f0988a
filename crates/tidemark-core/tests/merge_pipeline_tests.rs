use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tidemark_core::{
    BlockIndex, CancelToken, Codec, ContainerWriter, Filter, Indexer, JsonLineParser, Level,
    LevelMask, MergeOptions, MergePipeline, MergeStats, RecordParser, SourceInput, TimeWindow,
};

fn line(ts: i64, level: &str, msg: &str) -> String {
    format!("{{\"ts\":{ts},\"level\":\"{level}\",\"msg\":\"{msg}\"}}\n")
}

fn write_log(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("write log fixture");
    path
}

fn test_options() -> MergeOptions {
    MergeOptions {
        parser_workers: 2,
        formatter_workers: 2,
        ..MergeOptions::default()
    }
}

fn run_merge(options: MergeOptions, sources: Vec<SourceInput>) -> (String, MergeStats) {
    let pipeline = MergePipeline::new(options);
    let mut sink = Vec::new();
    let stats = pipeline.run(sources, &mut sink).expect("merge run");
    (String::from_utf8(sink).expect("utf8 output"), stats)
}

fn emitted_timestamps(output: &str) -> Vec<i64> {
    output
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("emitted json line");
            value["ts"].as_i64().expect("ts field")
        })
        .collect()
}

fn emitted_messages(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("emitted json line");
            value["msg"].as_str().expect("msg field").to_string()
        })
        .collect()
}

/// Builds the index of one raw block the way the parser would see it.
fn block_index(data: &[u8], sorted: bool) -> BlockIndex {
    let parsed = JsonLineParser.parse_block(data);
    let mut index = BlockIndex::new();
    index.lines = parsed.lines;
    for record in &parsed.records {
        index.observe(record.timestamp, record.level);
    }
    index.set_sorted(sorted);
    index
}

fn pack_container(path: &Path, blocks: &[String]) {
    let file = fs::File::create(path).expect("create container");
    let mut writer = ContainerWriter::new(file, Codec::Lz4);
    writer
        .write_global_header(blocks.len() as u32)
        .expect("container header");
    for block in blocks {
        let index = block_index(block.as_bytes(), true);
        writer.write_block(&index, block.as_bytes()).expect("container block");
    }
    writer.finish().expect("container footer");
}

#[test]
fn interleaved_blocks_merge_in_timestamp_order() {
    let dir = TempDir::new().unwrap();
    let a = write_log(
        dir.path(),
        "a.log",
        &(line(10, "info", "a0") + &line(30, "info", "a1")),
    );
    let b = write_log(
        dir.path(),
        "b.log",
        &(line(20, "info", "b0") + &line(40, "info", "b1")),
    );

    let (output, stats) = run_merge(
        test_options(),
        vec![SourceInput::file(a), SourceInput::file(b)],
    );
    assert_eq!(emitted_timestamps(&output), vec![10, 20, 30, 40]);
    assert_eq!(stats.records_emitted, 4);
    assert_eq!(stats.lines_invalid, 0);
}

#[test]
fn unsorted_block_is_emitted_in_order() {
    let dir = TempDir::new().unwrap();
    let path = write_log(
        dir.path(),
        "u.log",
        &(line(30, "info", "x") + &line(10, "info", "y") + &line(20, "info", "z")),
    );

    let (output, _) = run_merge(test_options(), vec![SourceInput::file(path)]);
    assert_eq!(emitted_timestamps(&output), vec![10, 20, 30]);
}

#[test]
fn level_filter_drops_unadmitted_records() {
    let dir = TempDir::new().unwrap();
    let a = write_log(
        dir.path(),
        "a.log",
        &(line(1, "info", "keep") + &line(2, "debug", "drop")),
    );
    let b = write_log(dir.path(), "b.log", &line(3, "error", "keep"));

    let options = MergeOptions {
        filter: Filter {
            levels: LevelMask::from_levels([Level::Info, Level::Error]),
            window: TimeWindow::default(),
        },
        ..test_options()
    };
    let (output, _) = run_merge(options, vec![SourceInput::file(a), SourceInput::file(b)]);
    assert_eq!(emitted_timestamps(&output), vec![1, 3]);
    assert_eq!(emitted_messages(&output), vec!["keep", "keep"]);
}

#[test]
fn equal_timestamps_follow_generation_order() {
    let dir = TempDir::new().unwrap();
    let a = write_log(dir.path(), "a.log", &line(5, "info", "first"));
    let b = write_log(dir.path(), "b.log", &line(5, "info", "second"));

    let (output, _) = run_merge(
        test_options(),
        vec![SourceInput::file(a), SourceInput::file(b)],
    );
    assert_eq!(emitted_messages(&output), vec!["first", "second"]);
}

#[test]
fn equal_timestamps_within_a_block_keep_input_order() {
    let dir = TempDir::new().unwrap();
    let path = write_log(
        dir.path(),
        "tie.log",
        &(line(7, "info", "one") + &line(7, "info", "two") + &line(7, "info", "three")),
    );

    let (output, _) = run_merge(test_options(), vec![SourceInput::file(path)]);
    assert_eq!(emitted_messages(&output), vec!["one", "two", "three"]);
}

#[test]
fn container_shortcut_avoids_the_block_store() {
    let dir = TempDir::new().unwrap();
    let blocks: Vec<String> = [(0, 9), (10, 19), (20, 29), (30, 39)]
        .iter()
        .map(|&(lo, hi)| line(lo, "info", "lo") + &line(hi, "info", "hi"))
        .collect();
    let path = dir.path().join("sorted.tlc");
    pack_container(&path, &blocks);

    // One parser makes the shortcut decision sequential and deterministic.
    let options = MergeOptions {
        parser_workers: 1,
        ..test_options()
    };
    let (output, stats) = run_merge(options, vec![SourceInput::container(path)]);
    assert_eq!(
        emitted_timestamps(&output),
        vec![0, 9, 10, 19, 20, 29, 30, 39]
    );
    assert_eq!(stats.store_peak_bytes, 0);
}

#[test]
fn overlapping_container_blocks_are_archived() {
    let dir = TempDir::new().unwrap();
    let blocks = vec![
        line(10, "info", "a0") + &line(30, "info", "a1"),
        line(20, "info", "b0") + &line(40, "info", "b1"),
    ];
    let path = dir.path().join("overlap.tlc");
    pack_container(&path, &blocks);

    let options = MergeOptions {
        parser_workers: 1,
        ..test_options()
    };
    let (output, stats) = run_merge(options, vec![SourceInput::container(path)]);
    assert_eq!(emitted_timestamps(&output), vec![10, 20, 30, 40]);
    // The second block overlaps the first, so at least one archive happened.
    assert!(stats.store_peak_bytes > 0);
}

#[test]
fn stream_blocks_are_archived_and_merge_in_order() {
    let content =
        line(10, "info", "a0") + &line(30, "info", "a1") + &line(20, "info", "b0") + &line(40, "info", "b1");
    // A small target block size splits the stream after the second line.
    let options = MergeOptions {
        block_size: line(10, "info", "a0").len() + 2,
        ..test_options()
    };
    let (output, stats) = run_merge(
        options,
        vec![SourceInput::stream(Cursor::new(content.into_bytes()))],
    );
    assert_eq!(emitted_timestamps(&output), vec![10, 20, 30, 40]);
    assert!(stats.blocks_read >= 2);
    assert!(stats.store_peak_bytes > 0);
}

#[test]
fn file_and_stream_modes_produce_identical_output() {
    let content = line(5, "info", "e")
        + &line(1, "debug", "a")
        + &line(9, "error", "f")
        + &line(1, "info", "b")
        + &line(4, "warning", "d");
    let dir = TempDir::new().unwrap();
    let path = write_log(dir.path(), "same.log", &content);

    let (from_file, _) = run_merge(test_options(), vec![SourceInput::file(path)]);
    let (from_stream, _) = run_merge(
        test_options(),
        vec![SourceInput::stream(Cursor::new(content.into_bytes()))],
    );
    assert_eq!(from_file, from_stream);
    assert_eq!(emitted_timestamps(&from_file), vec![1, 1, 4, 5, 9]);
}

#[test]
fn repeated_runs_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path = write_log(
        dir.path(),
        "r.log",
        &(line(3, "info", "c") + &line(1, "debug", "a") + &line(2, "error", "b")),
    );
    let options = MergeOptions {
        filter: Filter {
            levels: LevelMask::from_levels([Level::Info, Level::Error]),
            window: TimeWindow::default(),
        },
        ..test_options()
    };

    let (first, _) = run_merge(options.clone(), vec![SourceInput::file(path.clone())]);
    let (second, _) = run_merge(options, vec![SourceInput::file(path)]);
    assert_eq!(first, second);
}

#[test]
fn invalid_lines_are_counted_and_discarded() {
    let dir = TempDir::new().unwrap();
    let content = line(1, "info", "ok") + "not json\n" + &line(2, "info", "ok2") + "also broken\n";
    let path = write_log(dir.path(), "inv.log", &content);

    let (output, stats) = run_merge(test_options(), vec![SourceInput::file(path)]);
    assert_eq!(emitted_timestamps(&output), vec![1, 2]);
    assert_eq!(stats.lines_valid, 2);
    assert_eq!(stats.lines_invalid, 2);
}

#[test]
fn trailing_partial_line_is_discarded_as_invalid() {
    let dir = TempDir::new().unwrap();
    let content = line(1, "info", "ok") + "{\"ts\":2,\"level\":\"info\",\"msg\":\"cut";
    let path = write_log(dir.path(), "cut.log", &content);

    let (output, stats) = run_merge(test_options(), vec![SourceInput::file(path)]);
    assert_eq!(emitted_timestamps(&output), vec![1]);
    assert_eq!(stats.lines_invalid, 1);
}

#[test]
fn window_filter_is_applied_to_records() {
    let dir = TempDir::new().unwrap();
    let path = write_log(
        dir.path(),
        "w.log",
        &(line(5, "info", "early") + &line(15, "info", "kept") + &line(25, "info", "late")),
    );

    let options = MergeOptions {
        filter: Filter {
            levels: LevelMask::ALL,
            window: TimeWindow {
                since: Some(10),
                until: Some(20),
            },
        },
        ..test_options()
    };
    let (output, _) = run_merge(options, vec![SourceInput::file(path)]);
    assert_eq!(emitted_messages(&output), vec!["kept"]);
}

#[test]
fn indexed_file_skips_rejected_blocks() {
    let dir = TempDir::new().unwrap();
    let one = line(1, "info", "early");
    // Two blocks with disjoint time ranges; the window admits only the second.
    let content = one.clone() + &line(2, "info", "early2") + &line(100, "info", "kept") + &line(110, "info", "kept2");
    let path = write_log(dir.path(), "idx.log", &content);

    let block_size = one.len() + 2;
    let indexer = Indexer::new(block_size, Arc::new(JsonLineParser))
        .with_cache_dir(dir.path().join("cache"));
    let index = indexer.index_file(&path).expect("build index");
    assert!(index.source.blocks.len() >= 2);

    let options = MergeOptions {
        block_size,
        filter: Filter {
            levels: LevelMask::ALL,
            window: TimeWindow {
                since: Some(50),
                until: None,
            },
        },
        ..test_options()
    };
    let (output, stats) = run_merge(options, vec![SourceInput::indexed_file(path, index)]);
    assert_eq!(emitted_messages(&output), vec!["kept", "kept2"]);
    assert!(stats.blocks_skipped >= 1);
}

#[test]
fn indexed_fast_path_matches_unindexed_output() {
    let dir = TempDir::new().unwrap();
    let content = line(4, "info", "d") + &line(1, "info", "a") + &line(3, "warning", "c");
    let path = write_log(dir.path(), "fast.log", &content);

    let indexer = Indexer::new(1024 * 1024, Arc::new(JsonLineParser))
        .with_cache_dir(dir.path().join("cache"));
    let index = indexer.index_file(&path).expect("build index");

    let (plain, _) = run_merge(test_options(), vec![SourceInput::file(path.clone())]);
    let (indexed, _) = run_merge(
        test_options(),
        vec![SourceInput::indexed_file(path, index)],
    );
    assert_eq!(plain, indexed);
}

#[test]
fn untimed_records_sort_before_timed_ones() {
    let dir = TempDir::new().unwrap();
    let untimed = write_log(
        dir.path(),
        "untimed.log",
        "{\"level\":\"info\",\"msg\":\"no-ts\"}\n",
    );
    let timed = write_log(dir.path(), "timed.log", &line(10, "info", "timed"));

    let (output, _) = run_merge(
        test_options(),
        vec![SourceInput::file(timed), SourceInput::file(untimed)],
    );
    assert_eq!(emitted_messages(&output), vec!["no-ts", "timed"]);
}

#[test]
fn missing_timestamps_inherit_from_prior_record() {
    let dir = TempDir::new().unwrap();
    let content = line(10, "info", "a")
        + "{\"level\":\"info\",\"msg\":\"inherits\"}\n"
        + &line(20, "info", "b");
    let path = write_log(dir.path(), "inherit.log", &content);

    let (output, _) = run_merge(test_options(), vec![SourceInput::file(path)]);
    assert_eq!(emitted_messages(&output), vec!["a", "inherits", "b"]);
}

#[test]
fn cancelled_run_shuts_down_cleanly() {
    let dir = TempDir::new().unwrap();
    let path = write_log(dir.path(), "c.log", &line(1, "info", "x"));

    let token = CancelToken::new();
    token.cancel();
    let pipeline = MergePipeline::new(test_options());
    let mut sink = Vec::new();
    let stats = pipeline
        .run_with_cancel(vec![SourceInput::file(path)], &mut sink, &token)
        .expect("cancelled run is not an error");
    assert!(stats.cancelled);
    assert!(sink.is_empty());
}

#[test]
fn merging_all_three_modes_together_preserves_order() {
    let dir = TempDir::new().unwrap();
    let file = write_log(
        dir.path(),
        "f.log",
        &(line(10, "info", "f0") + &line(40, "info", "f1")),
    );
    let container_path = dir.path().join("c.tlc");
    pack_container(
        &container_path,
        &[line(20, "info", "c0") + &line(50, "info", "c1")],
    );
    let stream_content = line(30, "info", "s0") + &line(60, "info", "s1");

    let (output, _) = run_merge(
        test_options(),
        vec![
            SourceInput::file(file),
            SourceInput::container(container_path),
            SourceInput::stream(Cursor::new(stream_content.into_bytes())),
        ],
    );
    assert_eq!(emitted_timestamps(&output), vec![10, 20, 30, 40, 50, 60]);
}
