use std::io::{Read, Write};

use crc32fast::Hasher;

use crate::error::{Result, TidemarkError};
use crate::index::{BlockIndex, LineCounts, TsRange};
use crate::types::Timestamp;

/// Signature preceding the root frame.
pub const INDEX_MAGIC: u64 = u64::from_le_bytes(*b"TDMKIDX\0");
/// Current frame version.
pub const INDEX_VERSION: u32 = 1;

/// Index data for one block of the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub offset: u64,
    pub size: u64,
    pub index: BlockIndex,
}

/// Index data for a whole source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileMeta {
    pub size: u64,
    pub sha256: [u8; 32],
    pub path: String,
    /// Modification time, epoch milliseconds.
    pub modified: Timestamp,
    pub index: BlockIndex,
    pub blocks: Vec<SourceBlock>,
}

/// Root of a persistent index frame.
///
/// Serialized little-endian behind [`INDEX_MAGIC`] and terminated by a
/// CRC32 of everything preceding it. Loading rejects unknown versions,
/// unknown flag bits, inverted timestamp ranges, and checksum mismatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIndex {
    pub source: SourceFileMeta,
}

impl SourceIndex {
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut out = FrameWriter::new(writer);
        out.put_u64(INDEX_MAGIC)?;
        out.put_u32(INDEX_VERSION)?;
        out.put_u32(0)?; // reserved

        let source = &self.source;
        out.put_u64(source.size)?;
        out.put_bytes(&source.sha256)?;
        let path = source.path.as_bytes();
        let path_len = u32::try_from(path.len())
            .map_err(|_| TidemarkError::InvalidFrame("source path too long"))?;
        out.put_u32(path_len)?;
        out.put_bytes(path)?;
        out.put_i64(source.modified)?;
        write_index(&mut out, &source.index)?;
        out.put_u64(source.blocks.len() as u64)?;
        for block in &source.blocks {
            out.put_u64(block.offset)?;
            out.put_u64(block.size)?;
            write_index(&mut out, &block.index)?;
        }

        let checksum = out.finalize();
        writer.write_all(&checksum.to_le_bytes())?;
        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut input = FrameReader::new(reader);
        if input.get_u64()? != INDEX_MAGIC {
            return Err(TidemarkError::InvalidFrame("bad index magic"));
        }
        if input.get_u32()? != INDEX_VERSION {
            return Err(TidemarkError::InvalidFrame("unsupported index version"));
        }
        if input.get_u32()? != 0 {
            return Err(TidemarkError::InvalidFrame("reserved header bits set"));
        }

        let size = input.get_u64()?;
        let mut sha256 = [0u8; 32];
        input.get_bytes(&mut sha256)?;
        let path_len = input.get_u32()? as usize;
        let mut path = vec![0u8; path_len];
        input.get_bytes(&mut path)?;
        let path = String::from_utf8(path)
            .map_err(|_| TidemarkError::InvalidFrame("source path is not utf8"))?;
        let modified = input.get_i64()?;
        let index = read_index(&mut input)?;
        let block_count = input.get_u64()?;
        let block_count = usize::try_from(block_count)
            .map_err(|_| TidemarkError::InvalidFrame("block count exceeds usize range"))?;
        let mut blocks = Vec::with_capacity(block_count.min(1 << 20));
        for _ in 0..block_count {
            let offset = input.get_u64()?;
            let size = input.get_u64()?;
            let index = read_index(&mut input)?;
            blocks.push(SourceBlock {
                offset,
                size,
                index,
            });
        }

        let computed = input.finalize();
        let mut stored = [0u8; 4];
        reader.read_exact(&mut stored)?;
        let stored = u32::from_le_bytes(stored);
        if stored != computed {
            return Err(TidemarkError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        Ok(SourceIndex {
            source: SourceFileMeta {
                size,
                sha256,
                path,
                modified,
                index,
                blocks,
            },
        })
    }
}

fn write_index<W: Write>(out: &mut FrameWriter<'_, W>, index: &BlockIndex) -> Result<()> {
    out.put_u64(index.flags)?;
    out.put_u64(index.lines.valid)?;
    out.put_u64(index.lines.invalid)?;
    match index.timestamps {
        Some(range) => {
            out.put_u8(1)?;
            out.put_i64(range.min)?;
            out.put_i64(range.max)?;
        }
        None => {
            out.put_u8(0)?;
            out.put_i64(0)?;
            out.put_i64(0)?;
        }
    }
    Ok(())
}

fn read_index<R: Read>(input: &mut FrameReader<'_, R>) -> Result<BlockIndex> {
    let flags = input.get_u64()?;
    let valid = input.get_u64()?;
    let invalid = input.get_u64()?;
    let present = input.get_u8()?;
    let min = input.get_i64()?;
    let max = input.get_i64()?;
    let timestamps = match present {
        0 => None,
        1 => Some(TsRange { min, max }),
        _ => return Err(TidemarkError::InvalidFrame("invalid timestamp presence")),
    };
    let index = BlockIndex {
        flags,
        lines: LineCounts { valid, invalid },
        timestamps,
    };
    index.validate()?;
    Ok(index)
}

struct FrameWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Hasher,
}

impl<'a, W: Write> FrameWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_bytes(&[value])
    }

    fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

struct FrameReader<'a, R: Read> {
    inner: &'a mut R,
    hasher: Hasher,
}

impl<'a, R: Read> FrameReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    fn get_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.inner.read_exact(out)?;
        self.hasher.update(out);
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf)?;
        Ok(buf[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn get_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn finalize(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}
