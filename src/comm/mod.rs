//! Process-group substrate for the topology and redistribution layer.
//!
//! `ProcessGroup` abstracts the collective operations the layer needs:
//! duplication, splitting by key, rank/size queries, barriers, all-gathers,
//! variable-length gathers/scatters and sum reductions. Every method is a
//! blocking collective over all members of the group; a member that skips a
//! call the others make deadlocks the group.
//!
//! Implementations: `ThreadGroup` (ranks are threads of one process, nodes are
//! simulated) and `MpiGroup` (via the mpi crate, `distributed` feature).

#[cfg(feature = "distributed")]
pub mod mpi_group;
pub mod thread;

use std::ops::Range;

pub use thread::{contiguous_nodes, ThreadGroup};

#[cfg(feature = "distributed")]
pub use mpi_group::MpiGroup;

/// Element types that can travel through a collective.
#[cfg(feature = "distributed")]
pub trait Element: Copy + Default + Send + Sync + 'static + ::mpi::datatype::Equivalence {}

/// Element types that can travel through a collective.
#[cfg(not(feature = "distributed"))]
pub trait Element: Copy + Default + Send + Sync + 'static {}

impl Element for i32 {}
impl Element for i64 {}
impl Element for u64 {}
impl Element for f64 {}

/// Per-member element counts and their exclusive prefix offsets.
///
/// The receive-side description of a variable-length gather or scatter:
/// member `i` owns `offsets[i]..offsets[i + 1]` of the concatenated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTable {
    counts: Vec<usize>,
    offsets: Vec<usize>,
}

impl SegmentTable {
    pub fn from_counts(counts: Vec<usize>) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        let mut acc = 0;
        for &c in &counts {
            acc += c;
            offsets.push(acc);
        }
        Self { counts, offsets }
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Start offset of every member (the displacement array), plus the total.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Length of the concatenated buffer.
    pub fn total(&self) -> usize {
        self.offsets[self.counts.len()]
    }

    pub fn segment(&self, member: usize) -> Range<usize> {
        self.offsets[member]..self.offsets[member + 1]
    }
}

/// Collective operations over an ordered set of cooperating processes.
///
/// Variable-length gathers and scatters are rooted at rank 0, which is the
/// device-team lead in every group this crate roots them on.
pub trait ProcessGroup: Sized {
    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Name of the node this process runs on.
    fn processor_name(&self) -> String;

    /// Synchronization barrier.
    fn barrier(&self);

    /// A new group with the same members and an independent message space.
    fn duplicate(&self) -> Self;

    /// Partition the group by `color`; members are ordered by `(key, rank)`.
    ///
    /// Members passing `None` take part in the collective but receive no
    /// group.
    fn split(&self, color: Option<u32>, key: usize) -> Option<Self>;

    /// Partition the group into processes sharing a node.
    fn split_shared(&self) -> Self;

    /// Gather one value from every member, in rank order, on every member.
    fn all_gather<T: Element>(&self, value: T) -> Vec<T>;

    /// Sum a local scalar across all members.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Sum a local count across all members.
    fn all_reduce_sum_u64(&self, local: u64) -> u64;

    /// Element-wise sum of a vector across all members, in place.
    fn all_reduce_sum_vec(&self, local: &mut [f64]);

    /// Copy `data` from `root` into `data` on every other member.
    fn broadcast<T: Element>(&self, root: usize, data: &mut [T]);

    /// Concatenate every member's `local` on rank 0, in rank order.
    ///
    /// `table` must list every member's `local.len()`. Returns `Some` on rank 0
    /// and `None` elsewhere.
    fn gather_varcount<T: Element>(&self, local: &[T], table: &SegmentTable) -> Option<Vec<T>>;

    /// Inverse of `gather_varcount`: split rank 0's `global` by `table` and
    /// write each member's segment into its `out`.
    ///
    /// Only rank 0 reads `global`.
    fn scatter_varcount<T: Element>(&self, global: Option<&[T]>, table: &SegmentTable, out: &mut [T]);

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}
