//! Data movement between the per-process layout and the per-team layout.
//!
//! Matrix path: `extract` turns each process's two-block rows into a Local
//! CSR Block with global columns, `merge` stitches a team's blocks together on
//! the lead, and `partition` assigns every team its global row range.
//! Vector path: `vector` gathers a team's segments onto the lead and scatters
//! them back.

pub mod extract;
pub mod merge;
pub mod partition;
pub mod vector;

pub use extract::extract_local;
pub use merge::{merge_team, stitch_row_pointers, TeamMerge};
pub use partition::{block_range, RowPartition};
pub use vector::VectorLayout;
