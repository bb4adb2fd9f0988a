use std::cmp::min;
use std::io::{Read, Seek, SeekFrom};

use crc32fast::Hasher;

use crate::compression;
use crate::error::{Result, TidemarkError};

use super::{ContainerBlockHeader, Footer, GlobalHeader, BLOCK_HEADER_SIZE, GLOBAL_HEADER_SIZE};

/// Seekable reader for tlc containers.
///
/// Construction walks the block headers so callers can pre-filter on the
/// embedded indexes without touching any payload, then verifies the global
/// checksum. Payload reads seek directly to the requested block.
#[derive(Debug)]
pub struct ContainerReader<R: Read + Seek> {
    reader: R,
    global_header: GlobalHeader,
    blocks: Vec<(u64, ContainerBlockHeader)>,
    footer: Footer,
}

impl<R: Read + Seek> ContainerReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let global_header = GlobalHeader::read(&mut reader)?;
        let (blocks, footer_offset) = Self::scan_headers(&mut reader, global_header.block_count)?;

        reader.seek(SeekFrom::Start(footer_offset))?;
        let footer = Footer::read(&mut reader)?;

        let computed_crc = Self::compute_crc32_up_to(&mut reader, footer_offset)?;
        if computed_crc != footer.global_crc32 {
            return Err(TidemarkError::ChecksumMismatch {
                expected: footer.global_crc32,
                actual: computed_crc,
            });
        }

        Ok(Self {
            reader,
            global_header,
            blocks,
            footer,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.global_header.block_count
    }

    pub fn global_header(&self) -> GlobalHeader {
        self.global_header
    }

    pub fn footer(&self) -> Footer {
        self.footer
    }

    /// Per-block headers, in container order.
    pub fn headers(&self) -> impl Iterator<Item = &ContainerBlockHeader> {
        self.blocks.iter().map(|(_, header)| header)
    }

    pub fn header(&self, index: usize) -> Option<&ContainerBlockHeader> {
        self.blocks.get(index).map(|(_, header)| header)
    }

    /// Reads the still-compressed payload of block `index`, verifying its
    /// checksum.
    pub fn read_payload(&mut self, index: usize) -> Result<(ContainerBlockHeader, Vec<u8>)> {
        let (offset, header) = *self
            .blocks
            .get(index)
            .ok_or(TidemarkError::InvalidFrame("block index out of range"))?;
        self.reader
            .seek(SeekFrom::Start(offset + BLOCK_HEADER_SIZE as u64))?;
        let mut data = vec![0u8; header.compressed_size as usize];
        self.reader.read_exact(&mut data)?;

        let actual = crc32fast::hash(&data);
        if actual != header.crc32 {
            return Err(TidemarkError::ChecksumMismatch {
                expected: header.crc32,
                actual,
            });
        }
        Ok((header, data))
    }

    /// Reads and decompresses block `index`.
    pub fn read_block(&mut self, index: usize) -> Result<(ContainerBlockHeader, Vec<u8>)> {
        let (header, payload) = self.read_payload(index)?;
        let raw = compression::decompress(&payload, header.codec()?)?;
        if raw.len() != header.raw_size as usize {
            return Err(TidemarkError::InvalidFrame("decoded block size mismatch"));
        }
        Ok((header, raw))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn scan_headers(
        reader: &mut R,
        block_count: u32,
    ) -> Result<(Vec<(u64, ContainerBlockHeader)>, u64)> {
        let mut blocks = Vec::with_capacity(block_count as usize);
        let mut offset = GLOBAL_HEADER_SIZE as u64;
        for _ in 0..block_count {
            reader.seek(SeekFrom::Start(offset))?;
            let header = ContainerBlockHeader::read(reader)?;
            blocks.push((offset, header));
            offset = offset
                .checked_add(BLOCK_HEADER_SIZE as u64)
                .and_then(|value| value.checked_add(header.compressed_size as u64))
                .ok_or(TidemarkError::InvalidFrame("container offsets overflow"))?;
        }
        Ok((blocks, offset))
    }

    fn compute_crc32_up_to(reader: &mut R, len: u64) -> Result<u32> {
        reader.seek(SeekFrom::Start(0))?;
        let mut hasher = Hasher::new();
        let mut remaining = len;
        let mut buffer = [0u8; 8 * 1024];
        while remaining > 0 {
            let to_read = min(remaining as usize, buffer.len());
            reader.read_exact(&mut buffer[..to_read])?;
            hasher.update(&buffer[..to_read]);
            remaining -= to_read as u64;
        }
        Ok(hasher.finalize())
    }
}
