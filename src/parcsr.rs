//! Host framework view of a row-distributed sparse matrix.
//!
//! Each process owns a contiguous range of global rows, split into a
//! diagonal block (columns inside the process's column partition, numbered
//! locally) and an off-diagonal block whose compressed columns map to
//! global columns through `col_map`.

use crate::error::{Result, TeamSolveError};
use crate::sparse::CsrMatrix;
use std::ops::Range;

/// One process's share of a distributed sparse matrix.
#[derive(Debug, Clone)]
pub struct ParCsrMatrix {
    global_rows: usize,
    global_cols: usize,
    row_start: usize,
    col_start: usize,
    diag: CsrMatrix<f64>,
    offd: CsrMatrix<f64>,
    /// Global column of each off-diagonal block column, strictly ascending.
    col_map: Vec<usize>,
}

impl ParCsrMatrix {
    /// Assemble from the two blocks and the column map.
    ///
    /// Both blocks must have strictly ascending columns within each row, and
    /// no mapped column may fall inside the diagonal column range.
    pub fn new(
        global_rows: usize,
        global_cols: usize,
        row_start: usize,
        col_start: usize,
        diag: CsrMatrix<f64>,
        offd: CsrMatrix<f64>,
        col_map: Vec<usize>,
    ) -> Result<Self> {
        diag.validate()?;
        offd.validate()?;
        if diag.nrows != offd.nrows {
            return Err(TeamSolveError::Matrix(format!(
                "diagonal block has {} rows, off-diagonal block has {}",
                diag.nrows, offd.nrows
            )));
        }
        if row_start + diag.nrows > global_rows {
            return Err(TeamSolveError::Matrix(format!(
                "rows {}..{} exceed global row count {global_rows}",
                row_start,
                row_start + diag.nrows
            )));
        }
        let col_end = col_start + diag.ncols;
        if col_end > global_cols {
            return Err(TeamSolveError::Matrix(format!(
                "column partition {col_start}..{col_end} exceeds global column count {global_cols}"
            )));
        }
        if offd.ncols != col_map.len() {
            return Err(TeamSolveError::Matrix(format!(
                "off-diagonal block has {} columns but the column map has {} entries",
                offd.ncols,
                col_map.len()
            )));
        }
        if col_map.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TeamSolveError::Matrix("column map is not strictly ascending".into()));
        }
        if let Some(&c) = col_map
            .iter()
            .find(|&&c| c >= global_cols || (col_start..col_end).contains(&c))
        {
            return Err(TeamSolveError::Matrix(format!(
                "column map entry {c} lies inside the diagonal range or past the last column"
            )));
        }

        Ok(Self {
            global_rows,
            global_cols,
            row_start,
            col_start,
            diag,
            offd,
            col_map,
        })
    }

    /// Build this process's share from entries in global numbering.
    ///
    /// `rows` and `cols` are this process's row and column partitions. Every
    /// triplet's row must lie in `rows`; duplicates are summed.
    pub fn from_global_triplets(
        global_rows: usize,
        global_cols: usize,
        rows: Range<usize>,
        cols: Range<usize>,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self> {
        if let Some(&(r, c, _)) = triplets
            .iter()
            .find(|&&(r, c, _)| !rows.contains(&r) || c >= global_cols)
        {
            return Err(TeamSolveError::Matrix(format!(
                "entry ({r}, {c}) outside rows {rows:?} or past column {global_cols}"
            )));
        }

        let mut col_map: Vec<usize> = triplets
            .iter()
            .map(|&(_, c, _)| c)
            .filter(|c| !cols.contains(c))
            .collect();
        col_map.sort_unstable();
        col_map.dedup();

        let mut diag_entries = Vec::new();
        let mut offd_entries = Vec::new();
        for &(r, c, v) in triplets {
            let local_row = r - rows.start;
            if cols.contains(&c) {
                diag_entries.push((local_row, c - cols.start, v));
            } else {
                // col_map holds every off-diagonal column, so the search hits.
                let compressed = col_map.binary_search(&c).unwrap_or_else(|pos| pos);
                offd_entries.push((local_row, compressed, v));
            }
        }

        let nrows = rows.len();
        let diag = CsrMatrix::from_triplets(nrows, cols.len(), &diag_entries);
        let offd = CsrMatrix::from_triplets(nrows, col_map.len(), &offd_entries);
        Self::new(global_rows, global_cols, rows.start, cols.start, diag, offd, col_map)
    }

    pub fn global_rows(&self) -> usize {
        self.global_rows
    }

    pub fn global_cols(&self) -> usize {
        self.global_cols
    }

    /// Number of rows owned by this process.
    pub fn local_rows(&self) -> usize {
        self.diag.nrows
    }

    pub fn row_range(&self) -> Range<usize> {
        self.row_start..self.row_start + self.diag.nrows
    }

    pub fn col_range(&self) -> Range<usize> {
        self.col_start..self.col_start + self.diag.ncols
    }

    pub fn diag(&self) -> &CsrMatrix<f64> {
        &self.diag
    }

    pub fn offd(&self) -> &CsrMatrix<f64> {
        &self.offd
    }

    pub fn col_map(&self) -> &[usize] {
        &self.col_map
    }

    /// Non-zeros owned by this process across both blocks.
    pub fn local_nnz(&self) -> usize {
        self.diag.nnz() + self.offd.nnz()
    }
}
