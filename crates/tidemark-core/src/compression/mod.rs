use crate::error::{Result, TidemarkError};

pub mod lz4;

/// Block codec used by the block store and the compressed log container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Raw passthrough.
    None,
    #[default]
    Lz4,
}

impl Codec {
    pub fn to_flags(self) -> u8 {
        match self {
            Codec::None => 0,
            Codec::Lz4 => 1,
        }
    }

    pub fn from_flags(flags: u8) -> Result<Self> {
        match flags {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Lz4),
            _ => Err(TidemarkError::InvalidFrame("unknown codec flag")),
        }
    }
}

pub fn compress(data: &[u8], codec: Codec) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Lz4 => lz4::apply(data),
    }
}

pub fn decompress(data: &[u8], codec: Codec) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Lz4 => lz4::reverse(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let packed = compress(&data, Codec::Lz4).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, Codec::Lz4).unwrap(), data);
    }

    #[test]
    fn codec_flags_round_trip() {
        for codec in [Codec::None, Codec::Lz4] {
            assert_eq!(Codec::from_flags(codec.to_flags()).unwrap(), codec);
        }
        assert!(Codec::from_flags(7).is_err());
    }
}
