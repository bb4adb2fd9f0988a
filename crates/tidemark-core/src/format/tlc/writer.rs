use std::io::Write;

use crc32fast::Hasher;

use crate::compression::{self, Codec};
use crate::error::{Result, TidemarkError};
use crate::index::BlockIndex;

use super::{ContainerBlockHeader, Footer, GlobalHeader};

/// Writes tlc containers block by block and finalizes with a footer.
#[derive(Debug)]
pub struct ContainerWriter<W: Write> {
    writer: W,
    codec: Codec,
    expected_block_count: Option<u32>,
    blocks_written: u32,
    global_crc32: Hasher,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(writer: W, codec: Codec) -> Self {
        Self {
            writer,
            codec,
            expected_block_count: None,
            blocks_written: 0,
            global_crc32: Hasher::new(),
        }
    }

    pub fn write_global_header(&mut self, block_count: u32) -> Result<()> {
        if self.expected_block_count.is_some() {
            return Err(TidemarkError::InvalidFrame("global header already written"));
        }
        let bytes = GlobalHeader::new(block_count).to_bytes();
        self.writer.write_all(&bytes)?;
        self.global_crc32.update(&bytes);
        self.expected_block_count = Some(block_count);
        Ok(())
    }

    /// Compresses `raw` and appends it with a header carrying `index`.
    pub fn write_block(&mut self, index: &BlockIndex, raw: &[u8]) -> Result<()> {
        let expected = self
            .expected_block_count
            .ok_or(TidemarkError::InvalidFrame("global header must be written first"))?;
        if self.blocks_written >= expected {
            return Err(TidemarkError::InvalidFrame("container block count exceeded"));
        }

        let raw_size = u32::try_from(raw.len())
            .map_err(|_| TidemarkError::InvalidFrame("block exceeds u32 size range"))?;
        let payload = compression::compress(raw, self.codec)?;
        let compressed_size = u32::try_from(payload.len())
            .map_err(|_| TidemarkError::InvalidFrame("compressed block exceeds u32 size range"))?;
        let header = ContainerBlockHeader::new(
            index,
            self.codec,
            raw_size,
            compressed_size,
            crc32fast::hash(&payload),
        );

        let header_bytes = header.to_bytes();
        self.writer.write_all(&header_bytes)?;
        self.writer.write_all(&payload)?;
        self.global_crc32.update(&header_bytes);
        self.global_crc32.update(&payload);
        self.blocks_written += 1;
        Ok(())
    }

    pub fn blocks_written(&self) -> u32 {
        self.blocks_written
    }

    /// Finalizes the container. Fails if fewer blocks were written than
    /// declared in the global header.
    pub fn finish(mut self) -> Result<W> {
        let expected = self
            .expected_block_count
            .ok_or(TidemarkError::InvalidFrame("global header must be written first"))?;
        if self.blocks_written != expected {
            return Err(TidemarkError::InvalidFrame(
                "block count mismatch before writing footer",
            ));
        }
        Footer::new(self.global_crc32.finalize()).write(&mut self.writer)?;
        Ok(self.writer)
    }
}
