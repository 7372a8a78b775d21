//! Local CSR Block extraction.

use crate::parcsr::ParCsrMatrix;
use crate::sparse::CsrMatrix;

/// Convert one process's diagonal + off-diagonal rows into a single CSR block
/// with global column numbering.
///
/// Within each row the output holds the off-diagonal entries left of the
/// diagonal column range, then the diagonal block entries, then the remaining
/// off-diagonal entries. Both source blocks are sorted per row, so the result
/// is sorted without a sort pass.
pub fn extract_local(matrix: &ParCsrMatrix) -> CsrMatrix<f64> {
    let diag = matrix.diag();
    let offd = matrix.offd();
    let col_map = matrix.col_map();
    let col_start = matrix.col_range().start;
    let nrows = matrix.local_rows();
    let nnz = matrix.local_nnz();

    let mut row_pointers = Vec::with_capacity(nrows + 1);
    let mut col_indices = Vec::with_capacity(nnz);
    let mut values = Vec::with_capacity(nnz);
    row_pointers.push(0);

    for row in 0..nrows {
        let offd_range = offd.row_range(row);
        let offd_cols = &offd.col_indices[offd_range.clone()];
        let offd_vals = &offd.values[offd_range];
        // col_map is ascending, so the left part is a prefix of the row.
        let split = offd_cols.partition_point(|&c| col_map[c] < col_start);

        for (&c, &v) in offd_cols[..split].iter().zip(&offd_vals[..split]) {
            col_indices.push(col_map[c]);
            values.push(v);
        }

        let diag_range = diag.row_range(row);
        for idx in diag_range {
            col_indices.push(col_start + diag.col_indices[idx]);
            values.push(diag.values[idx]);
        }

        for (&c, &v) in offd_cols[split..].iter().zip(&offd_vals[split..]) {
            col_indices.push(col_map[c]);
            values.push(v);
        }

        row_pointers.push(col_indices.len());
    }

    CsrMatrix {
        nrows,
        ncols: matrix.global_cols(),
        values,
        col_indices,
        row_pointers,
    }
}
