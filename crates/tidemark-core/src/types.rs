use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

pub use crate::error::Result;

/// Milliseconds since the Unix epoch, signed.
pub type Timestamp = i64;

/// Monotonic block sequence number minted by the reader.
pub type Generation = u64;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Unknown,
}

impl Level {
    /// Index flag bit for this level, zero for `Unknown`.
    pub fn flag(self) -> u64 {
        match self {
            Level::Debug => crate::index::FLAG_LEVEL_DEBUG,
            Level::Info => crate::index::FLAG_LEVEL_INFO,
            Level::Warning => crate::index::FLAG_LEVEL_WARNING,
            Level::Error => crate::index::FLAG_LEVEL_ERROR,
            Level::Unknown => 0,
        }
    }

    /// Parses common level spellings, case-insensitively.
    pub fn parse(value: &str) -> Level {
        let value = value.trim();
        if value.eq_ignore_ascii_case("debug") || value.eq_ignore_ascii_case("dbg") {
            Level::Debug
        } else if value.eq_ignore_ascii_case("info") {
            Level::Info
        } else if value.eq_ignore_ascii_case("warning") || value.eq_ignore_ascii_case("warn") {
            Level::Warning
        } else if value.eq_ignore_ascii_case("error") || value.eq_ignore_ascii_case("err") {
            Level::Error
        } else {
            Level::Unknown
        }
    }
}

/// Set of admitted severities.
///
/// The four known levels map onto the low index flag bits; `Unknown` is
/// tracked separately because it has no index representation and can never
/// be excluded at block level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelMask {
    known: u64,
    unknown: bool,
}

impl LevelMask {
    pub const ALL: LevelMask = LevelMask {
        known: crate::index::FLAG_LEVEL_MASK,
        unknown: true,
    };

    pub fn empty() -> Self {
        Self {
            known: 0,
            unknown: false,
        }
    }

    pub fn with(mut self, level: Level) -> Self {
        match level {
            Level::Unknown => self.unknown = true,
            known => self.known |= known.flag(),
        }
        self
    }

    pub fn from_levels<I: IntoIterator<Item = Level>>(levels: I) -> Self {
        levels.into_iter().fold(Self::empty(), Self::with)
    }

    pub fn contains(&self, level: Level) -> bool {
        match level {
            Level::Unknown => self.unknown,
            known => self.known & known.flag() != 0,
        }
    }

    pub fn admits_unknown(&self) -> bool {
        self.unknown
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    /// True if a block whose index carries `flags` may contain an admitted
    /// record. Conservative: unknown-level records leave no trace in the
    /// flags, so a mask admitting `Unknown` never rejects a block.
    pub fn admits_flags(&self, flags: u64) -> bool {
        self.unknown || flags & crate::index::FLAG_LEVEL_MASK & self.known != 0
    }

    /// True if every level recorded in `flags` is admitted and unknown-level
    /// records cannot slip through unadmitted.
    pub fn admits_all_flags(&self, flags: u64) -> bool {
        let present = flags & crate::index::FLAG_LEVEL_MASK;
        present & !self.known == 0 && self.unknown
    }
}

impl Default for LevelMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Payload of a block while it moves through the pipeline.
///
/// Mapped payloads stay file-backed and are cheap to hold; owned payloads
/// carry their bytes (stream reads, decompressed container blocks, and
/// compacted archive buffers).
#[derive(Debug, Clone)]
pub enum BlockBytes {
    Mapped {
        map: Arc<Mmap>,
        start: usize,
        end: usize,
    },
    Owned(Bytes),
}

impl BlockBytes {
    pub fn owned(bytes: impl Into<Bytes>) -> Self {
        BlockBytes::Owned(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockBytes::Mapped { map, start, end } => &map[*start..*end],
            BlockBytes::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BlockBytes::Mapped { start, end, .. } => end - start,
            BlockBytes::Owned(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FLAG_LEVEL_DEBUG, FLAG_LEVEL_ERROR, FLAG_LEVEL_INFO};

    #[test]
    fn level_parse_accepts_common_spellings() {
        assert_eq!(Level::parse("WARN"), Level::Warning);
        assert_eq!(Level::parse("error"), Level::Error);
        assert_eq!(Level::parse("Info"), Level::Info);
        assert_eq!(Level::parse("trace"), Level::Unknown);
    }

    #[test]
    fn mask_admits_flags_conservatively() {
        let mask = LevelMask::from_levels([Level::Info, Level::Error]);
        assert!(mask.admits_flags(FLAG_LEVEL_INFO | FLAG_LEVEL_DEBUG));
        assert!(!mask.admits_flags(FLAG_LEVEL_DEBUG));

        // Admitting Unknown makes block-level rejection impossible.
        let with_unknown = mask.with(Level::Unknown);
        assert!(with_unknown.admits_flags(FLAG_LEVEL_DEBUG));
    }

    #[test]
    fn mask_full_admission_requires_unknown() {
        let mask = LevelMask::from_levels([Level::Info, Level::Error]);
        assert!(!mask.admits_all_flags(FLAG_LEVEL_INFO));
        let mask = mask.with(Level::Unknown);
        assert!(mask.admits_all_flags(FLAG_LEVEL_INFO | FLAG_LEVEL_ERROR));
        assert!(!mask.admits_all_flags(FLAG_LEVEL_DEBUG));
    }
}
