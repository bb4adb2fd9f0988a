use std::io::{Read, Write};

use crate::compression::Codec;
use crate::error::{Result, TidemarkError};
use crate::index::{BlockIndex, LineCounts, TsRange};

use super::{BLOCK_HEADER_SIZE, FOOTER_SIZE, GLOBAL_HEADER_SIZE, TLC_END_MAGIC, TLC_MAGIC, TLC_VERSION};

/// Global header of a tlc container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub reserved: u16,
    pub flags: u32,
    pub block_count: u32,
}

impl GlobalHeader {
    pub fn new(block_count: u32) -> Self {
        Self {
            magic: TLC_MAGIC,
            version: TLC_VERSION,
            reserved: 0,
            flags: 0,
            block_count,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; GLOBAL_HEADER_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> [u8; GLOBAL_HEADER_SIZE] {
        let mut bytes = [0u8; GLOBAL_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.magic);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.block_count.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: [u8; GLOBAL_HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        if magic != TLC_MAGIC {
            return Err(TidemarkError::InvalidFrame("invalid container magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != TLC_VERSION {
            return Err(TidemarkError::InvalidFrame("unsupported container version"));
        }
        let reserved = u16::from_le_bytes([bytes[6], bytes[7]]);
        if reserved != 0 {
            return Err(TidemarkError::InvalidFrame(
                "invalid global header reserved bits",
            ));
        }
        Ok(Self {
            magic,
            version,
            reserved,
            flags: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            block_count: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}

/// Header of a single compressed block.
///
/// Carries the block's [`BlockIndex`] so ingestion can reject a block from
/// its header alone and never decompress it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerBlockHeader {
    pub compressed_size: u32,
    pub raw_size: u32,
    pub codec_flags: u8,
    pub reserved: u8,
    pub reserved2: u16,
    pub crc32: u32,
    pub index_flags: u64,
    pub lines_valid: u64,
    pub lines_invalid: u64,
    pub ts_present: u8,
    pub ts_min: i64,
    pub ts_max: i64,
}

impl ContainerBlockHeader {
    pub fn new(
        index: &BlockIndex,
        codec: Codec,
        raw_size: u32,
        compressed_size: u32,
        crc32: u32,
    ) -> Self {
        let (ts_present, ts_min, ts_max) = match index.timestamps {
            Some(range) => (1, range.min, range.max),
            None => (0, 0, 0),
        };
        Self {
            compressed_size,
            raw_size,
            codec_flags: codec.to_flags(),
            reserved: 0,
            reserved2: 0,
            crc32,
            index_flags: index.flags,
            lines_valid: index.lines.valid,
            lines_invalid: index.lines.invalid,
            ts_present,
            ts_min,
            ts_max,
        }
    }

    pub fn codec(&self) -> Result<Codec> {
        Codec::from_flags(self.codec_flags)
    }

    /// Reconstructs the block's index descriptor.
    pub fn index(&self) -> BlockIndex {
        BlockIndex {
            flags: self.index_flags,
            lines: LineCounts {
                valid: self.lines_valid,
                invalid: self.lines_invalid,
            },
            timestamps: (self.ts_present == 1).then_some(TsRange {
                min: self.ts_min,
                max: self.ts_max,
            }),
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.compressed_size.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.raw_size.to_le_bytes());
        bytes[8] = self.codec_flags;
        bytes[9] = self.reserved;
        bytes[10..12].copy_from_slice(&self.reserved2.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.index_flags.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.lines_valid.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.lines_invalid.to_le_bytes());
        bytes[40] = self.ts_present;
        // bytes[41..48] stay zero
        bytes[48..56].copy_from_slice(&self.ts_min.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.ts_max.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: [u8; BLOCK_HEADER_SIZE]) -> Result<Self> {
        let read_u32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let read_u64 = |at: usize| {
            u64::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
                bytes[at + 4],
                bytes[at + 5],
                bytes[at + 6],
                bytes[at + 7],
            ])
        };
        let header = Self {
            compressed_size: read_u32(0),
            raw_size: read_u32(4),
            codec_flags: bytes[8],
            reserved: bytes[9],
            reserved2: u16::from_le_bytes([bytes[10], bytes[11]]),
            crc32: read_u32(12),
            index_flags: read_u64(16),
            lines_valid: read_u64(24),
            lines_invalid: read_u64(32),
            ts_present: bytes[40],
            ts_min: read_u64(48) as i64,
            ts_max: read_u64(56) as i64,
        };
        if bytes[41..48].iter().any(|&byte| byte != 0) {
            return Err(TidemarkError::InvalidFrame(
                "invalid block header padding",
            ));
        }
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.reserved != 0 || self.reserved2 != 0 {
            return Err(TidemarkError::InvalidFrame(
                "invalid block header reserved bits",
            ));
        }
        if self.ts_present > 1 {
            return Err(TidemarkError::InvalidFrame(
                "invalid timestamp presence flag",
            ));
        }
        self.codec()?;
        self.index().validate()?;
        Ok(())
    }
}

/// Container footer: end magic plus a CRC32 over the preceding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub end_magic: [u8; 4],
    pub global_crc32: u32,
}

impl Footer {
    pub fn new(global_crc32: u32) -> Self {
        Self {
            end_magic: TLC_END_MAGIC,
            global_crc32,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[..4].copy_from_slice(&self.end_magic);
        bytes[4..8].copy_from_slice(&self.global_crc32.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: [u8; FOOTER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        if magic != TLC_END_MAGIC {
            return Err(TidemarkError::InvalidFrame("invalid footer magic"));
        }
        Ok(Self {
            end_magic: magic,
            global_crc32: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}
