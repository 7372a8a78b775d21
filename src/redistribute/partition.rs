//! Global Row Partition Table.

use crate::comm::ProcessGroup;
use std::ops::Range;

/// Exclusive row range of every device team, in solver-group rank order.
///
/// `offsets[t]..offsets[t + 1]` are team `t`'s rows; the last offset is the
/// global row count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPartition {
    offsets: Vec<u64>,
}

impl RowPartition {
    /// Prefix-sum per-team row counts into offsets.
    pub fn from_counts(counts: &[u64]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        let mut acc = 0u64;
        for &c in counts {
            acc += c;
            offsets.push(acc);
        }
        Self { offsets }
    }

    /// All-gather every lead's team row count over the solver group and
    /// prefix-sum them.
    ///
    /// Collective over `solver`.
    pub fn gather<G: ProcessGroup>(solver: &G, team_rows: usize) -> Self {
        let counts = solver.all_gather(team_rows as u64);
        Self::from_counts(&counts)
    }

    /// Offsets array handed to the solver engine (`n_teams + 1` entries).
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn n_teams(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn total_rows(&self) -> usize {
        self.offsets[self.offsets.len() - 1] as usize
    }

    pub fn range(&self, team: usize) -> Range<usize> {
        self.offsets[team] as usize..self.offsets[team + 1] as usize
    }
}

/// Rows of block `index` when `total` rows are cut into `parts` contiguous
/// blocks whose sizes differ by at most one.
pub fn block_range(total: usize, parts: usize, index: usize) -> Range<usize> {
    let parts = parts.max(1);
    let basic = total / parts;
    let remain = total % parts;
    let start = index * basic + index.min(remain);
    let len = basic + usize::from(index < remain);
    start..start + len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ProcessGroup, ThreadGroup};

    #[test]
    fn offsets_are_monotonic_and_end_at_total() {
        let p = RowPartition::from_counts(&[3, 0, 2, 5]);
        assert_eq!(p.offsets(), &[0, 3, 3, 5, 10]);
        assert!(p.offsets().windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(p.total_rows(), 10);
        assert_eq!(p.n_teams(), 4);
        assert_eq!(p.range(2), 3..5);
    }

    #[test]
    fn gathered_over_solver_group() {
        let tables = ThreadGroup::run(&[0, 0, 1], |g| RowPartition::gather(&g, g.rank() + 1));
        for t in tables {
            assert_eq!(t.offsets(), &[0, 1, 3, 6]);
        }
    }

    #[test]
    fn block_ranges_cover_everything() {
        let ranges: Vec<_> = (0..3).map(|i| block_range(10, 3, i)).collect();
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(block_range(2, 4, 3), 2..2);
    }
}
