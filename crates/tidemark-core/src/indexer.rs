use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, TidemarkError};
use crate::format::{SourceBlock, SourceFileMeta, SourceIndex};
use crate::index::BlockIndex;
use crate::io::{BlockScanner, MmapInput};
use crate::record::RecordParser;
use crate::types::Timestamp;

/// Builds persistent indexes for regular files in a preliminary pass.
///
/// Frames are cached in a directory keyed by a hash of the source path and
/// the indexing parameters. A cached frame is reused only when the source's
/// size and modification time still match.
pub struct Indexer {
    block_size: usize,
    parser: Arc<dyn RecordParser>,
    cache_dir: Option<PathBuf>,
}

impl Indexer {
    pub fn new(block_size: usize, parser: Arc<dyn RecordParser>) -> Self {
        Self {
            block_size: block_size.max(1),
            parser,
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Returns the index for `path`, building and caching it if needed.
    pub fn index_file(&self, path: &Path) -> Result<SourceIndex> {
        let metadata = fs::metadata(path).map_err(|source| TidemarkError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let size = metadata.len();
        let modified = system_time_millis(metadata.modified()?);

        let cache_path = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(self.cache_key(path)));
        if let Some(cache_path) = &cache_path {
            if let Some(index) = try_load_cached(cache_path, size, modified) {
                debug!(path = %path.display(), "reusing cached index");
                return Ok(index);
            }
        }

        let index = self.build(path, size, modified)?;
        if let Some(cache_path) = &cache_path {
            if let Some(parent) = cache_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(cache_path)?;
            index.save(&mut file)?;
        }
        Ok(index)
    }

    fn build(&self, path: &Path, size: u64, modified: Timestamp) -> Result<SourceIndex> {
        let mmap = MmapInput::open(path)?;
        let data = mmap.data();
        let scanner = BlockScanner::new(self.block_size);
        let split = scanner.split_mapped(data);

        let mut total = BlockIndex::new();
        let mut blocks = Vec::with_capacity(split.blocks.len());
        let mut chronological = true;
        let mut prev_max: Option<Timestamp> = None;
        for (start, end) in split.blocks {
            let block_index = self.index_block(&data[start..end]);
            if !block_index.sorted() {
                chronological = false;
            }
            if let Some(range) = block_index.timestamps {
                if prev_max.map(|max| range.min < max).unwrap_or(false) {
                    chronological = false;
                }
                prev_max = Some(range.max);
            }
            total.merge(&block_index);
            blocks.push(SourceBlock {
                offset: start as u64,
                size: (end - start) as u64,
                index: block_index,
            });
        }
        if split.discarded_partial {
            total.add_invalid();
        }
        total.set_sorted(chronological);

        Ok(SourceIndex {
            source: SourceFileMeta {
                size,
                sha256: Sha256::digest(data).into(),
                path: path.to_string_lossy().into_owned(),
                modified,
                index: total,
                blocks,
            },
        })
    }

    fn index_block(&self, data: &[u8]) -> BlockIndex {
        let parsed = self.parser.parse_block(data);
        let mut index = BlockIndex::new();
        index.lines = parsed.lines;
        let mut sorted = true;
        let mut prev: Option<Timestamp> = None;
        for record in &parsed.records {
            index.observe(record.timestamp, record.level);
            if let Some(ts) = record.timestamp {
                if prev.map(|prev| ts < prev).unwrap_or(false) {
                    sorted = false;
                }
                prev = Some(ts);
            }
        }
        index.set_sorted(sorted);
        index
    }

    fn cache_key(&self, path: &Path) -> String {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update((self.block_size as u64).to_le_bytes());
        format!("{}.idx", hex::encode(hasher.finalize()))
    }
}

fn try_load_cached(path: &Path, size: u64, modified: Timestamp) -> Option<SourceIndex> {
    let mut file = fs::File::open(path).ok()?;
    let index = SourceIndex::load(&mut file).ok()?;
    (index.source.size == size && index.source.modified == modified).then_some(index)
}

fn system_time_millis(ts: SystemTime) -> Timestamp {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis().min(i64::MAX as u128) as i64,
        Err(err) => -(err.duration().as_millis().min(i64::MAX as u128) as i64),
    }
}
