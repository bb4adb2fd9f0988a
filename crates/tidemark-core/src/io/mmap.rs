use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};

use crate::error::{Result, TidemarkError};
use crate::types::BlockBytes;

/// Memory-mapped regular-file input.
///
/// Blocks handed out as [`BlockBytes::Mapped`] stay file-backed, so holding
/// many of them in flight does not grow resident memory with file size.
#[derive(Debug, Clone)]
pub struct MmapInput {
    mmap: Option<Arc<Mmap>>,
    path: PathBuf,
    len: u64,
}

impl MmapInput {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| TidemarkError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.metadata()?.len();

        let mmap = if len == 0 {
            None
        } else {
            Some(Arc::new(unsafe { MmapOptions::new().map(&file)? }))
        };

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len.min(usize::MAX as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the whole mapping as a slice.
    pub fn data(&self) -> &[u8] {
        match &self.mmap {
            Some(map) => &map[..],
            None => &[],
        }
    }

    /// Returns `[start, end)` of the file as a zero-copy block payload.
    pub fn mapped_slice(&self, start: usize, end: usize) -> Result<BlockBytes> {
        if start > end || end > self.len() {
            return Err(TidemarkError::InvalidFrame("invalid mmap slice range"));
        }
        match &self.mmap {
            Some(map) => Ok(BlockBytes::Mapped {
                map: Arc::clone(map),
                start,
                end,
            }),
            None => Ok(BlockBytes::Owned(Bytes::new())),
        }
    }
}
