use std::time::SystemTime;

use anyhow::bail;

/// An inclusive range of sequence numbers that was not received (yet)
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
    pub modified: SystemTime,
}

impl Gap {
    fn new(start: u64, end: u64) -> Gap {
        Gap {
            start,
            end,
            modified: SystemTime::now(),
        }
    }

    fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq <= self.end
    }
}

/// Tracks the range `[min, max]` of sequence numbers seen for a frame set, and the parts of that
///  range that were not received.
///
/// Gaps are kept sorted by start, disjoint and non-adjacent. Sequence numbers are unsigned 64 bit:
///  the wire carries them as i64, but `0xffff_ffff_ffff_ffff` is the largest value rather than -1.
///
/// This is a plain value, see [super::gap_tracker::GapTracker] for the shared, synchronized
///  version.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GapList {
    min: u64,
    max: u64,
    gaps: Vec<Gap>,
}

impl GapList {
    /// a range of which nothing was received yet, i.e. one gap covering all of it
    pub fn new(min: u64, max: u64) -> anyhow::Result<GapList> {
        if min > max {
            bail!("gap list minimum {} is greater than maximum {}", min, max);
        }
        Ok(GapList {
            min,
            max,
            gaps: vec![Gap::new(min, max)],
        })
    }

    /// a range consisting of a single received sequence number
    pub fn single(seq: u64) -> GapList {
        GapList {
            min: seq,
            max: seq,
            gaps: Vec::new(),
        }
    }

    /// Restores a previously stored gap list. Gaps must lie in `[min, max]`; they are sorted and
    ///  checked for overlaps.
    pub fn from_parts(min: u64, max: u64, mut gaps: Vec<Gap>) -> anyhow::Result<GapList> {
        if min > max {
            bail!("gap list minimum {} is greater than maximum {}", min, max);
        }
        gaps.sort_by_key(|g| g.start);

        let mut prev_end: Option<u64> = None;
        for gap in &gaps {
            if gap.start > gap.end || gap.start < min || gap.end > max {
                bail!("gap [{}, {}] is not a valid range within [{}, {}]", gap.start, gap.end, min, max);
            }
            if let Some(prev_end) = prev_end {
                if gap.start <= prev_end.saturating_add(1) {
                    bail!("gaps overlap or touch at {}", gap.start);
                }
            }
            prev_end = Some(gap.end);
        }

        Ok(GapList { min, max, gaps })
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn is_max_unsigned(value: u64) -> bool {
        value == u64::MAX
    }

    pub fn gap_entries(&self) -> &[Gap] {
        &self.gaps
    }

    pub fn gaps(&self) -> Vec<(u64, u64)> {
        self.gaps.iter()
            .map(|g| (g.start, g.end))
            .collect()
    }

    /// gaps that do not reach up to `u64::MAX`, which is how an open-ended range is reported
    pub fn gaps_exclusive(&self) -> Vec<(u64, u64)> {
        self.gaps.iter()
            .filter(|g| !Self::is_max_unsigned(g.end))
            .map(|g| (g.start, g.end))
            .collect()
    }

    /// index of the gap containing `seq`, if any
    fn find_gap(&self, seq: u64) -> Option<usize> {
        let idx = self.gaps.partition_point(|g| g.start <= seq);
        if idx == 0 {
            return None;
        }
        if self.gaps[idx - 1].contains(seq) {
            Some(idx - 1)
        }
        else {
            None
        }
    }

    /// Records a received sequence number, expanding the tracked range if it lies outside.
    pub fn add_value(&mut self, seq: u64) {
        if seq < self.min {
            // NB: seq < min, so min >= 1 and seq < u64::MAX
            if seq + 1 < self.min {
                self.gaps.insert(0, Gap::new(seq + 1, self.min - 1));
            }
            self.min = seq;
            return;
        }
        if seq > self.max {
            if self.max + 1 < seq {
                self.gaps.push(Gap::new(self.max + 1, seq - 1));
            }
            self.max = seq;
            return;
        }

        let Some(idx) = self.find_gap(seq) else {
            return;
        };

        let gap = &mut self.gaps[idx];
        if gap.start == gap.end {
            self.gaps.remove(idx);
        }
        else if seq == gap.start {
            gap.start += 1;
            gap.modified = SystemTime::now();
        }
        else if seq == gap.end {
            gap.end -= 1;
            gap.modified = SystemTime::now();
        }
        else {
            let upper = Gap::new(seq + 1, gap.end);
            gap.end = seq - 1;
            gap.modified = upper.modified;
            self.gaps.insert(idx + 1, upper);
        }
    }

    /// Records an inclusive range of received sequence numbers. The range must lie within
    ///  `[min, max]`.
    pub fn add_value_range(&mut self, start: u64, end: u64) -> anyhow::Result<()> {
        if start > end {
            bail!("range start {} is greater than its end {}", start, end);
        }
        if start < self.min || end > self.max {
            bail!("range [{}, {}] is outside of the tracked range [{}, {}]", start, end, self.min, self.max);
        }

        let mut result = Vec::with_capacity(self.gaps.len() + 1);
        for gap in self.gaps.drain(..) {
            if gap.end < start || gap.start > end {
                result.push(gap);
                continue;
            }
            if gap.start < start {
                result.push(Gap::new(gap.start, start - 1));
            }
            if gap.end > end {
                result.push(Gap::new(end + 1, gap.end));
            }
        }
        self.gaps = result;
        Ok(())
    }

    /// drops gaps that were last modified before `cutoff`, treating them as permanently lost
    pub fn remove_gaps_modified_before(&mut self, cutoff: SystemTime) -> usize {
        let before = self.gaps.len();
        self.gaps.retain(|g| g.modified >= cutoff);
        before - self.gaps.len()
    }
}
