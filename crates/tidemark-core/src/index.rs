use crate::error::{Result, TidemarkError};
use crate::types::{Level, Timestamp};

/// A record at this severity occurs in the block.
pub const FLAG_LEVEL_DEBUG: u64 = 0x01;
pub const FLAG_LEVEL_INFO: u64 = 0x02;
pub const FLAG_LEVEL_WARNING: u64 = 0x04;
pub const FLAG_LEVEL_ERROR: u64 = 0x08;
/// Bits reserved for severity occurrence flags.
pub const FLAG_LEVEL_MASK: u64 = 0xFF;
/// Records appear in non-decreasing timestamp order.
pub const FLAG_SORTED: u64 = 0x100;
/// Reserved; carried through unchanged, never interpreted.
pub const FLAG_BINARY: u64 = 0x8000_0000_0000_0000;

/// All bits a well-formed index may carry.
pub const FLAG_KNOWN_MASK: u64 = FLAG_LEVEL_MASK | FLAG_SORTED | FLAG_BINARY;

/// Valid / invalid line accounting for a block or a whole source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    pub valid: u64,
    pub invalid: u64,
}

/// Closed timestamp range, `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsRange {
    pub min: Timestamp,
    pub max: Timestamp,
}

impl TsRange {
    pub fn point(ts: Timestamp) -> Self {
        Self { min: ts, max: ts }
    }

    pub fn widen(&mut self, ts: Timestamp) {
        self.min = self.min.min(ts);
        self.max = self.max.max(ts);
    }
}

/// Compact descriptor of a block: severity occurrence flags, line counts,
/// and the timestamp range of its records. `timestamps == None` means no
/// record carried a parseable timestamp; such a block is admitted for all
/// time windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockIndex {
    pub flags: u64,
    pub lines: LineCounts,
    pub timestamps: Option<TsRange>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts one valid line, widening the range and severity flags.
    pub fn add_valid(&mut self, ts: Option<Timestamp>, level: Level) {
        self.lines.valid += 1;
        self.observe(ts, level);
    }

    /// Widens the range and severity flags without touching line counts.
    /// Used where line accounting and record survival diverge (a filtered
    /// block still accounts every parsed line).
    pub fn observe(&mut self, ts: Option<Timestamp>, level: Level) {
        self.flags |= level.flag();
        if let Some(ts) = ts {
            match &mut self.timestamps {
                Some(range) => range.widen(ts),
                None => self.timestamps = Some(TsRange::point(ts)),
            }
        }
    }

    /// Accounts one invalid line.
    pub fn add_invalid(&mut self) {
        self.lines.invalid += 1;
    }

    /// Folds another index into this one. Sortedness does not survive a
    /// merge; callers re-establish it when the combined order is known.
    pub fn merge(&mut self, other: &BlockIndex) {
        self.flags |= other.flags & (FLAG_LEVEL_MASK | FLAG_BINARY);
        self.flags &= !FLAG_SORTED;
        self.lines.valid += other.lines.valid;
        self.lines.invalid += other.lines.invalid;
        match (&mut self.timestamps, other.timestamps) {
            (Some(range), Some(other)) => {
                range.widen(other.min);
                range.widen(other.max);
            }
            (None, Some(other)) => self.timestamps = Some(other),
            _ => {}
        }
    }

    pub fn sorted(&self) -> bool {
        self.flags & FLAG_SORTED != 0
    }

    pub fn set_sorted(&mut self, sorted: bool) {
        if sorted {
            self.flags |= FLAG_SORTED;
        } else {
            self.flags &= !FLAG_SORTED;
        }
    }

    /// Lower bound on every record timestamp, `i64::MIN` when untimed.
    pub fn ts_min(&self) -> Timestamp {
        self.timestamps.map(|range| range.min).unwrap_or(i64::MIN)
    }

    /// Upper bound on every record timestamp, `i64::MIN` when untimed.
    pub fn ts_max(&self) -> Timestamp {
        self.timestamps.map(|range| range.max).unwrap_or(i64::MIN)
    }

    /// Rejects indexes carrying flag bits outside the reserved ranges or an
    /// inverted timestamp range.
    pub fn validate(&self) -> Result<()> {
        if self.flags & !FLAG_KNOWN_MASK != 0 {
            return Err(TidemarkError::InvalidFrame(
                "index flags outside reserved ranges",
            ));
        }
        if let Some(range) = self.timestamps {
            if range.min > range.max {
                return Err(TidemarkError::InvalidFrame(
                    "index timestamp range is inverted",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_valid_tracks_range_and_flags() {
        let mut index = BlockIndex::new();
        index.add_valid(Some(30), Level::Info);
        index.add_valid(Some(10), Level::Error);
        index.add_valid(None, Level::Unknown);
        index.add_invalid();

        assert_eq!(index.lines, LineCounts { valid: 3, invalid: 1 });
        assert_eq!(index.flags & FLAG_LEVEL_MASK, FLAG_LEVEL_INFO | FLAG_LEVEL_ERROR);
        assert_eq!(index.timestamps, Some(TsRange { min: 10, max: 30 }));
    }

    #[test]
    fn merge_widens_and_clears_sorted() {
        let mut left = BlockIndex::new();
        left.add_valid(Some(10), Level::Info);
        left.set_sorted(true);

        let mut right = BlockIndex::new();
        right.add_valid(Some(5), Level::Debug);

        left.merge(&right);
        assert!(!left.sorted());
        assert_eq!(left.timestamps, Some(TsRange { min: 5, max: 10 }));
        assert_eq!(left.lines.valid, 2);
    }

    #[test]
    fn validate_rejects_unknown_bits() {
        let index = BlockIndex {
            flags: 0x200,
            ..BlockIndex::default()
        };
        assert!(index.validate().is_err());

        let reserved = BlockIndex {
            flags: FLAG_BINARY | FLAG_SORTED,
            ..BlockIndex::default()
        };
        assert!(reserved.validate().is_ok());
    }

    #[test]
    fn untimed_index_bounds_are_minimum() {
        let index = BlockIndex::new();
        assert_eq!(index.ts_min(), i64::MIN);
        assert_eq!(index.ts_max(), i64::MIN);
    }
}
