//! Compressed Sparse Row (CSR) matrix.
//!
//! Used for the host framework's diagonal/off-diagonal blocks, for each
//! process's Local CSR Block, and for the merged Team CSR Block held by a
//! device-team lead. Column indices of local and team blocks are global.

use crate::error::{Result, TeamSolveError};
use std::ops::{AddAssign, Range};

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<T>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    /// `row_pointers[nrows]` = total number of non-zeros.
    pub row_pointers: Vec<usize>,
}

impl<T: Copy + Default + AddAssign> CsrMatrix<T> {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Assemble from raw CSR arrays, checking the structural invariants.
    pub fn from_raw_parts(
        nrows: usize,
        ncols: usize,
        row_pointers: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<T>,
    ) -> Result<Self> {
        let m = Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        };
        m.validate()?;
        Ok(m)
    }

    /// Number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Range into `col_indices`/`values` covering row `row`.
    pub fn row_range(&self, row: usize) -> Range<usize> {
        self.row_pointers[row]..self.row_pointers[row + 1]
    }

    /// Build CSR matrix from (row, col, value) triplets.
    /// Duplicate entries at the same (row, col) are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        // Sort indices by (row, col) without requiring T: Ord
        let mut indices: Vec<usize> = (0..triplets.len()).collect();
        indices.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let first = indices[0];
        let mut cur_row = triplets[first].0;
        let mut cur_col = triplets[first].1;
        let mut cur_val = triplets[first].2;

        for &idx in &indices[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
            } else {
                values.push(cur_val);
                col_indices.push(cur_col);
                row_pointers[cur_row + 1] += 1;
                cur_row = row;
                cur_col = col;
                cur_val = val;
            }
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        // Convert per-row counts to cumulative offsets
        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Check row-pointer shape and monotonicity, and that every row's
    /// column indices are strictly ascending and in range.
    pub fn validate(&self) -> Result<()> {
        if self.row_pointers.len() != self.nrows + 1 {
            return Err(TeamSolveError::Matrix(format!(
                "row pointer length {} does not match {} rows",
                self.row_pointers.len(),
                self.nrows
            )));
        }
        if self.row_pointers[0] != 0 {
            return Err(TeamSolveError::Matrix("row pointer must start at 0".into()));
        }
        if self.col_indices.len() != self.values.len() {
            return Err(TeamSolveError::Matrix(format!(
                "{} column indices for {} values",
                self.col_indices.len(),
                self.values.len()
            )));
        }
        if self.row_pointers[self.nrows] != self.values.len() {
            return Err(TeamSolveError::Matrix(format!(
                "last row pointer {} does not match nnz {}",
                self.row_pointers[self.nrows],
                self.values.len()
            )));
        }
        // Monotonic pointers ending at nnz keep every row slice in bounds.
        if let Some(row) = self.row_pointers.windows(2).position(|w| w[0] > w[1]) {
            return Err(TeamSolveError::Matrix(format!(
                "row pointer decreases at row {row}"
            )));
        }
        for row in 0..self.nrows {
            let cols = &self.col_indices[self.row_range(row)];
            if let Some(&last) = cols.last() {
                if last >= self.ncols {
                    return Err(TeamSolveError::Matrix(format!(
                        "column {last} out of range in row {row} (ncols = {})",
                        self.ncols
                    )));
                }
            }
            if cols.windows(2).any(|w| w[0] >= w[1]) {
                return Err(TeamSolveError::Matrix(format!(
                    "column indices of row {row} are not strictly ascending"
                )));
            }
        }
        Ok(())
    }

    /// Convert to dense matrix (row-major). For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<T>> {
        let mut dense = vec![vec![T::default(); self.ncols]; self.nrows];
        for row in 0..self.nrows {
            for idx in self.row_range(row) {
                dense[row][self.col_indices[idx]] = self.values[idx];
            }
        }
        dense
    }
}

impl CsrMatrix<f64> {
    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        let mut y = vec![0.0; self.nrows];
        for (row, yi) in y.iter_mut().enumerate() {
            let mut sum = 0.0;
            for idx in self.row_range(row) {
                sum += self.values[idx] * x[self.col_indices[idx]];
            }
            *yi = sum;
        }
        y
    }

    /// Value stored at (row, col), if present.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let range = self.row_range(row);
        let cols = &self.col_indices[range.clone()];
        cols.binary_search(&col)
            .ok()
            .map(|pos| self.values[range.start + pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matrix() {
        let m: CsrMatrix<f64> = CsrMatrix::new(3, 3);
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.row_pointers, vec![0, 0, 0, 0]);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_from_triplets_duplicates_summed() {
        let triplets = vec![(0, 0, 1.0), (0, 0, 2.0), (1, 1, 3.0)];
        let m = CsrMatrix::from_triplets(2, 2, &triplets);
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.to_dense(), vec![vec![3.0, 0.0], vec![0.0, 3.0]]);
    }

    #[test]
    fn test_spmv() {
        // [[2, 1], [0, 3]] * [1, 2] = [4, 6]
        let triplets = vec![(0, 0, 2.0), (0, 1, 1.0), (1, 1, 3.0)];
        let m = CsrMatrix::from_triplets(2, 2, &triplets);
        assert_eq!(m.spmv(&[1.0, 2.0]), vec![4.0, 6.0]);
        assert_eq!(m.get(0, 1), Some(1.0));
        assert_eq!(m.get(1, 0), None);
    }

    #[test]
    fn validate_rejects_unsorted_row() {
        let err = CsrMatrix::from_raw_parts(1, 3, vec![0, 2], vec![2, 0], vec![1.0, 1.0])
            .expect_err("unsorted columns must be rejected");
        assert!(format!("{err}").contains("strictly ascending"));
    }

    #[test]
    fn validate_rejects_bad_last_pointer() {
        let err = CsrMatrix::from_raw_parts(2, 2, vec![0, 1, 3], vec![0, 1], vec![1.0, 1.0])
            .expect_err("nnz mismatch must be rejected");
        assert!(format!("{err}").contains("nnz"));
    }

    #[test]
    fn validate_rejects_pointer_past_nnz() {
        let err = CsrMatrix::from_raw_parts(2, 3, vec![0, 5, 2], vec![0, 1], vec![1.0, 1.0])
            .expect_err("pointer past nnz must be rejected");
        assert!(format!("{err}").contains("decreases at row 1"));
    }

    #[test]
    fn validate_rejects_out_of_range_column() {
        assert!(CsrMatrix::from_raw_parts(1, 2, vec![0, 1], vec![5], vec![1.0]).is_err());
    }
}
