use crate::index::BlockIndex;
use crate::types::{Level, LevelMask, Timestamp};

/// Half-open time window `[since, until)` in epoch milliseconds. `None`
/// bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl TimeWindow {
    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.since.map(|since| ts >= since).unwrap_or(true)
            && self.until.map(|until| ts < until).unwrap_or(true)
    }

    /// True if the whole closed range `[min, max]` lies inside the window.
    pub fn covers(&self, min: Timestamp, max: Timestamp) -> bool {
        self.contains(min) && self.contains(max)
    }

    /// True if the closed range `[min, max]` intersects the window.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.since.map(|since| max >= since).unwrap_or(true)
            && self.until.map(|until| min < until).unwrap_or(true)
    }
}

/// Combined level and time-window filter, applied at block level through
/// the index and at record level through each record's attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Filter {
    pub levels: LevelMask,
    pub window: TimeWindow,
}

impl Filter {
    pub fn pass_all(&self) -> bool {
        self.levels.is_all() && self.window.is_unbounded()
    }

    /// Block-level admission: may the block contain an admitted record?
    ///
    /// A block with no timestamps is admitted for every window; a record
    /// without its own timestamp cannot be excluded by it either.
    pub fn accept_index(&self, index: &BlockIndex) -> bool {
        if index.lines.valid == 0 {
            return false;
        }
        if !self.levels.admits_flags(index.flags) {
            return false;
        }
        match index.timestamps {
            Some(range) => self.window.overlaps(range.min, range.max),
            None => true,
        }
    }

    /// True if every record the index describes is admitted, making the
    /// record-level pass a no-op.
    pub fn admits_fully(&self, index: &BlockIndex) -> bool {
        if self.pass_all() {
            return true;
        }
        if !self.levels.admits_all_flags(index.flags) {
            return false;
        }
        match index.timestamps {
            Some(range) => self.window.covers(range.min, range.max),
            // Untimed records cannot be window-checked, so full admission
            // requires an unbounded window.
            None => self.window.is_unbounded(),
        }
    }

    /// Record-level admission.
    pub fn accept_record(&self, ts: Option<Timestamp>, level: Level) -> bool {
        if !self.levels.contains(level) {
            return false;
        }
        match ts {
            Some(ts) => self.window.contains(ts),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BlockIndex;

    fn timed_index(min: Timestamp, max: Timestamp, level: Level) -> BlockIndex {
        let mut index = BlockIndex::new();
        index.add_valid(Some(min), level);
        index.add_valid(Some(max), level);
        index
    }

    #[test]
    fn window_overlap_and_cover() {
        let window = TimeWindow {
            since: Some(10),
            until: Some(20),
        };
        assert!(window.overlaps(5, 12));
        assert!(!window.overlaps(20, 30));
        assert!(window.covers(10, 19));
        assert!(!window.covers(10, 20));
    }

    #[test]
    fn accept_index_rejects_disjoint_window() {
        let filter = Filter {
            window: TimeWindow {
                since: Some(100),
                until: None,
            },
            ..Filter::default()
        };
        assert!(!filter.accept_index(&timed_index(10, 50, Level::Info)));
        assert!(filter.accept_index(&timed_index(90, 150, Level::Info)));
    }

    #[test]
    fn untimed_index_passes_every_window() {
        let filter = Filter {
            window: TimeWindow {
                since: Some(100),
                until: Some(200),
            },
            ..Filter::default()
        };
        let mut index = BlockIndex::new();
        index.add_valid(None, Level::Info);
        assert!(filter.accept_index(&index));
        assert!(!filter.admits_fully(&index));
    }

    #[test]
    fn empty_block_is_never_admitted() {
        let filter = Filter::default();
        let mut index = BlockIndex::new();
        index.add_invalid();
        assert!(!filter.accept_index(&index));
    }

    #[test]
    fn admits_fully_matches_level_subset() {
        let filter = Filter {
            levels: LevelMask::from_levels([Level::Info, Level::Error, Level::Unknown]),
            ..Filter::default()
        };
        assert!(filter.admits_fully(&timed_index(1, 2, Level::Info)));
        assert!(!filter.admits_fully(&timed_index(1, 2, Level::Debug)));
    }
}
