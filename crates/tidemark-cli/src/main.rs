use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tidemark_core::{
    ContainerWriter, Filter, Indexer, JsonLineParser, Level, LevelMask, MergeOptions,
    MergePipeline, MergeStats, SourceInput, TimeWindow,
};

#[derive(Parser)]
#[command(
    name = "tidemark",
    version,
    about = "Chronological log merge",
    long_about = "Merge log records from files, streams, and tlc containers in strict timestamp order."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge one or more log sources into chronological order.
    Merge {
        /// Input log files, `.tlc` containers, or `-` for standard input.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output file (defaults to standard output).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Admit only these severities (repeatable).
        #[arg(long, value_enum)]
        level: Vec<LevelArg>,

        /// Admit only records at or after this epoch-millisecond timestamp.
        #[arg(long)]
        since: Option<i64>,

        /// Admit only records before this epoch-millisecond timestamp.
        #[arg(long)]
        until: Option<i64>,

        /// Target block size (supports suffixes K/M/G, e.g. 64K, 1M).
        #[arg(long, default_value = "1M", value_parser = parse_size)]
        block_size: usize,

        /// Parser worker count (defaults to CPU count).
        #[arg(long, default_value_t = num_cpus::get())]
        parsers: usize,

        /// Formatter worker count (defaults to CPU count).
        #[arg(long, default_value_t = num_cpus::get())]
        formatters: usize,

        /// Block store retention cap (supports suffixes K/M/G).
        #[arg(long, default_value = "256M", value_parser = parse_size)]
        store_cap: usize,

        /// Build and cache persistent indexes for regular-file inputs here.
        #[arg(long)]
        index_dir: Option<PathBuf>,

        /// Print run statistics to standard error.
        #[arg(long)]
        stats: bool,
    },
    /// Build (or refresh) the persistent index for a log file.
    Index {
        /// Source log file.
        input: PathBuf,

        /// Index cache directory.
        #[arg(long, default_value = ".tidemark-index")]
        index_dir: PathBuf,

        /// Target block size (supports suffixes K/M/G).
        #[arg(long, default_value = "1M", value_parser = parse_size)]
        block_size: usize,
    },
    /// Pack a log file into a compressed tlc container.
    Pack {
        /// Source log file.
        input: PathBuf,

        /// Destination container path (defaults to <input>.tlc).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target block size (supports suffixes K/M/G).
        #[arg(long, default_value = "1M", value_parser = parse_size)]
        block_size: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    Debug,
    Info,
    Warning,
    Error,
    Unknown,
}

impl From<LevelArg> for Level {
    fn from(value: LevelArg) -> Self {
        match value {
            LevelArg::Debug => Level::Debug,
            LevelArg::Info => Level::Info,
            LevelArg::Warning => Level::Warning,
            LevelArg::Error => Level::Error,
            LevelArg::Unknown => Level::Unknown,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Merge {
            inputs,
            output,
            level,
            since,
            until,
            block_size,
            parsers,
            formatters,
            store_cap,
            index_dir,
            stats,
        } => merge_command(
            inputs,
            output,
            level,
            TimeWindow { since, until },
            block_size,
            parsers,
            formatters,
            store_cap,
            index_dir,
            stats,
        ),
        Commands::Index {
            input,
            index_dir,
            block_size,
        } => index_command(input, index_dir, block_size),
        Commands::Pack {
            input,
            output,
            block_size,
        } => pack_command(input, output, block_size),
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_command(
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    levels: Vec<LevelArg>,
    window: TimeWindow,
    block_size: usize,
    parsers: usize,
    formatters: usize,
    store_cap: usize,
    index_dir: Option<PathBuf>,
    stats: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = Filter {
        levels: if levels.is_empty() {
            LevelMask::ALL
        } else {
            LevelMask::from_levels(levels.into_iter().map(Level::from))
        },
        window,
    };
    let options = MergeOptions {
        block_size: block_size.max(1),
        parser_workers: parsers.max(1),
        formatter_workers: formatters.max(1),
        store_cap: store_cap.max(1),
        filter,
        ..MergeOptions::default()
    };

    let indexer = index_dir.map(|dir| {
        Indexer::new(options.block_size, Arc::new(JsonLineParser)).with_cache_dir(dir)
    });

    let mut sources = Vec::with_capacity(inputs.len());
    for input in inputs {
        if input.as_os_str() == "-" {
            sources.push(SourceInput::stream(io::stdin()));
        } else if is_container(&input) {
            sources.push(SourceInput::container(input));
        } else if let Some(indexer) = &indexer {
            let index = indexer.index_file(&input)?;
            sources.push(SourceInput::indexed_file(input, index));
        } else {
            sources.push(SourceInput::file(input));
        }
    }

    let pipeline = MergePipeline::new(options);
    let run_stats = match output {
        Some(path) => {
            let mut sink = BufWriter::new(File::create(&path)?);
            let run_stats = pipeline.run(sources, &mut sink)?;
            sink.flush()?;
            run_stats
        }
        None => {
            let mut sink = BufWriter::new(io::stdout());
            let run_stats = pipeline.run(sources, &mut sink)?;
            sink.flush()?;
            run_stats
        }
    };

    if stats {
        print_merge_summary(&run_stats);
    }
    Ok(())
}

fn index_command(
    input: PathBuf,
    index_dir: PathBuf,
    block_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let indexer =
        Indexer::new(block_size.max(1), Arc::new(JsonLineParser)).with_cache_dir(&index_dir);
    let index = indexer.index_file(&input)?;
    let source = &index.source;

    println!("index complete");
    println!("  source: {}", input.display());
    println!("  cache: {}", index_dir.display());
    println!("  size: {}", format_bytes(source.size));
    println!("  blocks: {}", source.blocks.len());
    println!(
        "  lines: {} valid, {} invalid",
        source.index.lines.valid, source.index.lines.invalid
    );
    match source.index.timestamps {
        Some(range) => println!("  time range: {} .. {} ms", range.min, range.max),
        None => println!("  time range: none"),
    }
    Ok(())
}

fn pack_command(
    input: PathBuf,
    output: Option<PathBuf>,
    block_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let output_path = output.unwrap_or_else(|| default_container_path(&input));
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    // Index in-process without touching any cache; block boundaries and
    // per-block indexes feed straight into the container.
    let index = Indexer::new(block_size.max(1), Arc::new(JsonLineParser)).index_file(&input)?;
    let mmap = tidemark_core::MmapInput::open(&input)?;
    let data = mmap.data();

    let block_count = u32::try_from(index.source.blocks.len())
        .map_err(|_| "too many blocks for one container")?;
    let mut writer = ContainerWriter::new(
        BufWriter::new(File::create(&output_path)?),
        tidemark_core::Codec::Lz4,
    );
    writer.write_global_header(block_count)?;
    let mut raw_total = 0u64;
    for block in &index.source.blocks {
        let start = block.offset as usize;
        let end = start + block.size as usize;
        writer.write_block(&block.index, &data[start..end])?;
        raw_total += block.size;
    }
    let mut sink = writer.finish()?;
    sink.flush()?;

    let packed_total = std::fs::metadata(&output_path)?.len();
    println!("pack complete");
    println!("  source: {}", input.display());
    println!("  output: {}", output_path.display());
    println!("  blocks: {block_count}");
    println!("  raw bytes: {}", format_bytes(raw_total));
    println!("  packed bytes: {}", format_bytes(packed_total));
    if raw_total > 0 {
        println!(
            "  ratio: {:.3}x",
            packed_total as f64 / raw_total as f64
        );
    }
    Ok(())
}

fn print_merge_summary(stats: &MergeStats) {
    eprintln!("merge complete");
    eprintln!("  elapsed: {}", format_duration(stats.elapsed));
    eprintln!(
        "  blocks: {} read, {} skipped, {} dropped",
        stats.blocks_read, stats.blocks_skipped, stats.blocks_dropped
    );
    eprintln!(
        "  lines: {} valid, {} invalid",
        stats.lines_valid, stats.lines_invalid
    );
    eprintln!(
        "  emitted: {} records, {}",
        stats.records_emitted,
        format_bytes(stats.bytes_emitted)
    );
    if stats.store_peak_bytes > 0 {
        eprintln!("  block store peak: {}", format_bytes(stats.store_peak_bytes));
    }
    if stats.cancelled {
        eprintln!("  run was cancelled");
    }
}

fn is_container(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("tlc"))
        .unwrap_or(false)
}

fn default_container_path(input: &Path) -> PathBuf {
    let mut out = input.as_os_str().to_os_string();
    out.push(".tlc");
    PathBuf::from(out)
}

fn parse_size(value: &str) -> Result<usize, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("size cannot be empty".to_string());
    }

    let split_at = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (num_part, suffix_part) = trimmed.split_at(split_at);
    if num_part.is_empty() {
        return Err(format!("invalid size: {value}"));
    }

    let base: usize = num_part
        .parse()
        .map_err(|_| format!("invalid size number: {value}"))?;

    let multiplier = match suffix_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1usize,
        "k" | "kb" => 1024usize,
        "m" | "mb" => 1024usize * 1024usize,
        "g" | "gb" => 1024usize * 1024usize * 1024usize,
        other => return Err(format!("invalid size suffix '{other}' in '{value}'")),
    };

    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflow: {value}"))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let millis = duration.subsec_millis();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 {
        format!("{minutes:02}:{seconds:02}")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}
