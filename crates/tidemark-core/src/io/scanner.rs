use std::io::Read;

use memchr::{memchr, memrchr};

use crate::error::Result;

const STREAM_READ_CHUNK: usize = 64 * 1024;

/// Splits source bytes into blocks delimited at line boundaries.
///
/// A block runs until it reaches or exceeds the target size and then
/// extends to the next newline, so no block ever splits a line. A trailing
/// run not terminated by a newline is excluded and reported to the caller,
/// which accounts it as one invalid line.
#[derive(Debug, Clone)]
pub struct BlockScanner {
    target_block_size: usize,
}

/// Block ranges of a fully mapped source.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MappedSplit {
    pub blocks: Vec<(usize, usize)>,
    pub discarded_partial: bool,
}

impl BlockScanner {
    pub fn new(target_block_size: usize) -> Self {
        Self {
            target_block_size: target_block_size.max(1),
        }
    }

    pub fn target_block_size(&self) -> usize {
        self.target_block_size
    }

    /// Boundary of the block starting at `start`: the index one past the
    /// first newline at or beyond the target size, or `data.len()`.
    pub fn find_boundary(&self, data: &[u8], start: usize) -> usize {
        let len = data.len();
        let target = start.saturating_add(self.target_block_size).min(len);
        if target >= len {
            return len;
        }
        if data[target - 1] == b'\n' {
            return target;
        }
        match memchr(b'\n', &data[target..]) {
            Some(pos) => target + pos + 1,
            None => len,
        }
    }

    /// Splits a mapped source into block ranges.
    pub fn split_mapped(&self, data: &[u8]) -> MappedSplit {
        let complete = match memrchr(b'\n', data) {
            Some(pos) => pos + 1,
            None => 0,
        };
        let mut blocks = Vec::new();
        let mut start = 0usize;
        while start < complete {
            let end = self.find_boundary(&data[..complete], start);
            blocks.push((start, end));
            start = end;
        }
        MappedSplit {
            blocks,
            discarded_partial: complete < data.len(),
        }
    }
}

/// One block produced from a non-seekable source.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub data: Vec<u8>,
    /// The source ended with an unterminated line that was dropped.
    pub discarded_partial: bool,
}

/// Incremental newline-delimited chunker over a `Read` source. Bytes are
/// consumed exactly once; each emitted block is owned.
pub struct StreamChunker<R> {
    reader: R,
    scanner: BlockScanner,
    carry: Vec<u8>,
    eof: bool,
}

impl<R: Read> StreamChunker<R> {
    pub fn new(reader: R, target_block_size: usize) -> Self {
        Self {
            reader,
            scanner: BlockScanner::new(target_block_size),
            carry: Vec::with_capacity(target_block_size.max(1)),
            eof: false,
        }
    }

    /// Returns the next block, or `None` once the source is exhausted.
    pub fn next_block(&mut self) -> Result<Option<StreamChunk>> {
        let target = self.scanner.target_block_size();
        loop {
            if self.carry.len() >= target {
                if let Some(pos) = memchr(b'\n', &self.carry[target - 1..]) {
                    let boundary = target - 1 + pos + 1;
                    let data = self.carry.drain(..boundary).collect();
                    return Ok(Some(StreamChunk {
                        data,
                        discarded_partial: false,
                    }));
                }
            }
            if self.eof {
                return Ok(self.final_block());
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut scratch = [0u8; STREAM_READ_CHUNK];
        let read = self.reader.read(&mut scratch)?;
        if read == 0 {
            self.eof = true;
        } else {
            self.carry.extend_from_slice(&scratch[..read]);
        }
        Ok(())
    }

    fn final_block(&mut self) -> Option<StreamChunk> {
        if self.carry.is_empty() {
            return None;
        }
        let complete = match memrchr(b'\n', &self.carry) {
            Some(pos) => pos + 1,
            None => 0,
        };
        let discarded_partial = complete < self.carry.len();
        let data = self.carry.drain(..complete).collect::<Vec<u8>>();
        self.carry.clear();
        if data.is_empty() && !discarded_partial {
            return None;
        }
        Some(StreamChunk {
            data,
            discarded_partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_extends_to_next_newline() {
        let scanner = BlockScanner::new(4);
        let data = b"aaaaaa\nbb\n";
        // Target lands mid-line; the block extends to include the newline.
        assert_eq!(scanner.find_boundary(data, 0), 7);
        assert_eq!(scanner.find_boundary(data, 7), 10);
    }

    #[test]
    fn boundary_at_exact_newline_does_not_overshoot() {
        let scanner = BlockScanner::new(4);
        let data = b"aaa\nbbb\n";
        assert_eq!(scanner.find_boundary(data, 0), 4);
    }

    #[test]
    fn split_mapped_drops_trailing_partial() {
        let scanner = BlockScanner::new(4);
        let split = scanner.split_mapped(b"aaa\nbbb\ncc");
        assert_eq!(split.blocks, vec![(0, 4), (4, 8)]);
        assert!(split.discarded_partial);
    }

    #[test]
    fn stream_chunker_respects_line_boundaries() {
        let data = b"aaaa\nbb\ncccc\n".to_vec();
        let mut chunker = StreamChunker::new(&data[..], 6);
        let first = chunker.next_block().unwrap().unwrap();
        assert_eq!(first.data, b"aaaa\nbb\n");
        let second = chunker.next_block().unwrap().unwrap();
        assert_eq!(second.data, b"cccc\n");
        assert!(chunker.next_block().unwrap().is_none());
    }

    #[test]
    fn stream_chunker_reports_discarded_partial() {
        let data = b"aaaa\nbbbb".to_vec();
        let mut chunker = StreamChunker::new(&data[..], 64);
        let chunk = chunker.next_block().unwrap().unwrap();
        assert_eq!(chunk.data, b"aaaa\n");
        assert!(chunk.discarded_partial);
        assert!(chunker.next_block().unwrap().is_none());
    }
}
