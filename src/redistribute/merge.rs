//! Team CSR Block assembly on the device-team lead.
//!
//! Every member ships its row pointers, global column indices and values to
//! the lead with length-prefixed gathers. The all-gathered row and non-zero
//! counts give the lead the exact segment boundaries, so row-pointer
//! stitching never has to guess where one member's prefix ends.

use crate::comm::{ProcessGroup, SegmentTable};
use crate::error::{Result, TeamSolveError};
use crate::sparse::CsrMatrix;

/// Result of merging a team's Local CSR Blocks.
pub struct TeamMerge {
    /// Local row count of every team member, in team rank order.
    pub rows: SegmentTable,
    /// Local non-zero count of every team member, in team rank order.
    pub nnz: SegmentTable,
    /// The merged block; present only on the lead.
    pub block: Option<CsrMatrix<f64>>,
}

/// Merge every member's Local CSR Block onto team rank 0.
///
/// Collective over `team`.
pub fn merge_team<G: ProcessGroup>(team: &G, local: &CsrMatrix<f64>) -> Result<TeamMerge> {
    let _span = tracing::debug_span!("merge_team", team_size = team.size()).entered();

    let row_counts = team.all_gather(local.nrows as u64);
    let nnz_counts = team.all_gather(local.nnz() as u64);
    let rows = SegmentTable::from_counts(row_counts.iter().map(|&c| c as usize).collect());
    let nnz = SegmentTable::from_counts(nnz_counts.iter().map(|&c| c as usize).collect());
    // Each member ships its full row-pointer array, leading zero included.
    let pointers = SegmentTable::from_counts(rows.counts().iter().map(|&r| r + 1).collect());

    let local_pointers = to_wide(&local.row_pointers)?;
    let local_cols = to_wide(&local.col_indices)?;

    let all_pointers = team.gather_varcount(&local_pointers, &pointers);
    let all_cols = team.gather_varcount(&local_cols, &nnz);
    let all_values = team.gather_varcount(&local.values, &nnz);

    let block = match (all_pointers, all_cols, all_values) {
        (Some(all_pointers), Some(all_cols), Some(values)) => {
            let row_pointers = stitch_row_pointers(&all_pointers, &pointers)?;
            let col_indices = all_cols
                .into_iter()
                .map(|c| {
                    usize::try_from(c).map_err(|_| {
                        TeamSolveError::Matrix(format!("negative column index {c} in team block"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let block = CsrMatrix::from_raw_parts(
                rows.total(),
                local.ncols,
                row_pointers,
                col_indices,
                values,
            )?;
            tracing::debug!(rows = block.nrows, nnz = block.nnz(), "team block merged");
            Some(block)
        }
        _ => None,
    };

    Ok(TeamMerge { rows, nnz, block })
}

/// Join per-member row-pointer arrays into one globally monotonic array.
///
/// `segments` gives the length of each member's array (its row count plus
/// one). Every array starts at zero; member `m`'s entries are shifted by the
/// non-zero total of members `0..m` and its leading zero is dropped, except
/// for the very first entry of the result.
pub fn stitch_row_pointers(gathered: &[i64], segments: &SegmentTable) -> Result<Vec<usize>> {
    if gathered.len() != segments.total() {
        return Err(TeamSolveError::Matrix(format!(
            "gathered {} row pointers, segment table expects {}",
            gathered.len(),
            segments.total()
        )));
    }

    let rows = segments.total().saturating_sub(segments.len());
    let mut merged = Vec::with_capacity(rows + 1);
    merged.push(0usize);
    let mut base = 0usize;

    for member in 0..segments.len() {
        let segment = &gathered[segments.segment(member)];
        let (&first, rest) = segment.split_first().ok_or_else(|| {
            TeamSolveError::Matrix(format!("member {member} sent an empty row-pointer array"))
        })?;
        if first != 0 {
            return Err(TeamSolveError::Matrix(format!(
                "row pointers of member {member} start at {first}, expected 0"
            )));
        }
        let mut prev = 0i64;
        for &p in rest {
            if p < prev {
                return Err(TeamSolveError::Matrix(format!(
                    "row pointers of member {member} decrease ({prev} -> {p})"
                )));
            }
            merged.push(base + p as usize);
            prev = p;
        }
        base += prev as usize;
    }

    Ok(merged)
}

fn to_wide(values: &[usize]) -> Result<Vec<i64>> {
    values
        .iter()
        .map(|&v| {
            i64::try_from(v)
                .map_err(|_| TeamSolveError::Matrix(format!("index {v} does not fit in 64 bits")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadGroup;

    fn table(counts: &[usize]) -> SegmentTable {
        SegmentTable::from_counts(counts.to_vec())
    }

    #[test]
    fn single_member_needs_no_stitching() {
        let merged = stitch_row_pointers(&[0, 2, 3, 5], &table(&[4])).unwrap();
        assert_eq!(merged, vec![0, 2, 3, 5]);
    }

    #[test]
    fn three_members_are_offset_by_prior_nnz() {
        // Members with 2, 1 and 2 rows holding 3, 2 and 4 non-zeros.
        let gathered = [0, 1, 3, 0, 2, 0, 1, 4];
        let merged = stitch_row_pointers(&gathered, &table(&[3, 2, 3])).unwrap();
        assert_eq!(merged, vec![0, 1, 3, 5, 6, 9]);
    }

    #[test]
    fn leading_empty_rows_are_not_mistaken_for_boundaries() {
        // Member 1 starts with two empty rows: its array is [0, 0, 0, 2].
        let gathered = [0, 2, 0, 0, 0, 2];
        let merged = stitch_row_pointers(&gathered, &table(&[2, 4])).unwrap();
        assert_eq!(merged, vec![0, 2, 2, 2, 4]);
    }

    #[test]
    fn member_without_rows_contributes_nothing() {
        let gathered = [0, 1, 0, 0, 3];
        let merged = stitch_row_pointers(&gathered, &table(&[2, 1, 2])).unwrap();
        assert_eq!(merged, vec![0, 1, 4]);
    }

    #[test]
    fn rejects_segment_not_starting_at_zero() {
        let err = stitch_row_pointers(&[0, 1, 1, 2], &table(&[2, 2])).unwrap_err();
        assert!(format!("{err}").contains("start at 1"));
    }

    #[test]
    fn merged_team_block_sums_rows_and_nnz() {
        // Team of three; rank r owns rows with r + 1 entries each.
        let result = ThreadGroup::run(&[0, 0, 0], |team| {
            let r = team.rank();
            let nrows = r + 1;
            let row0 = r * (r + 1) / 2;
            let mut triplets = Vec::new();
            for i in 0..nrows {
                for c in 0..=r {
                    triplets.push((i, c * 2, (row0 + i) as f64));
                }
            }
            let local = CsrMatrix::from_triplets(nrows, 8, &triplets);
            let merged = merge_team(&team, &local).unwrap();
            (local.nrows, local.nnz(), merged.block, merged.rows.total())
        });

        let rows: usize = result.iter().map(|r| r.0).sum();
        let nnz: usize = result.iter().map(|r| r.1).sum();
        let block = result[0].2.as_ref().unwrap();
        assert_eq!(block.nrows, rows);
        assert_eq!(block.nnz(), nnz);
        assert!(block.row_pointers.windows(2).all(|w| w[0] <= w[1]));
        assert!(block.row_pointers[1..].iter().all(|&p| p > 0));
        assert_eq!(block.get(3, 4), Some(3.0));
        assert!(result[1].2.is_none() && result[2].2.is_none());
        assert!(result.iter().all(|r| r.3 == 6));
    }
}
