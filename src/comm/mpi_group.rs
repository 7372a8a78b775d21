//! MPI process group.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements `ProcessGroup` over an owned `SimpleCommunicator`; derived
//! groups (duplicates, splits) own their communicators and free them on drop.
//!
//! # Usage
//!
//! The caller must initialize MPI before constructing `MpiGroup`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let world = MpiGroup::world();
//! ```

use super::{Element, ProcessGroup, SegmentTable};
use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;
use mpi::Count;

/// MPI-backed process group.
pub struct MpiGroup {
    comm: SimpleCommunicator,
}

impl MpiGroup {
    /// The world communicator. Requires `mpi::initialize()` to have been called.
    pub fn world() -> Self {
        Self {
            comm: SimpleCommunicator::world(),
        }
    }

    pub fn from_communicator(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    pub fn communicator(&self) -> &SimpleCommunicator {
        &self.comm
    }
}

fn to_counts(table: &SegmentTable) -> (Vec<Count>, Vec<Count>) {
    let counts = table.counts().iter().map(|&c| c as Count).collect();
    let displs = table.offsets()[..table.len()]
        .iter()
        .map(|&d| d as Count)
        .collect();
    (counts, displs)
}

impl ProcessGroup for MpiGroup {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn processor_name(&self) -> String {
        mpi::environment::processor_name().unwrap_or_else(|_| "unknown".to_string())
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn duplicate(&self) -> Self {
        Self {
            comm: self.comm.duplicate(),
        }
    }

    fn split(&self, color: Option<u32>, key: usize) -> Option<Self> {
        let color = match color {
            Some(c) => Color::with_value(c as i32),
            None => Color::undefined(),
        };
        self.comm
            .split_by_color_with_key(color, key as i32)
            .map(|comm| Self { comm })
    }

    fn split_shared(&self) -> Self {
        Self {
            comm: self.comm.split_shared(self.comm.rank()),
        }
    }

    fn all_gather<T: Element>(&self, value: T) -> Vec<T> {
        let mut out = vec![T::default(); self.size()];
        self.comm.all_gather_into(&value, &mut out[..]);
        out
    }

    fn all_reduce_sum(&self, local: f64) -> f64 {
        let mut global = 0.0f64;
        self.comm
            .all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn all_reduce_sum_u64(&self, local: u64) -> u64 {
        let mut global = 0u64;
        self.comm
            .all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) {
        let send = local.to_vec();
        self.comm
            .all_reduce_into(&send[..], local, SystemOperation::sum());
    }

    fn broadcast<T: Element>(&self, root: usize, data: &mut [T]) {
        self.comm.process_at_rank(root as i32).broadcast_into(data);
    }

    fn gather_varcount<T: Element>(&self, local: &[T], table: &SegmentTable) -> Option<Vec<T>> {
        let root = self.comm.process_at_rank(0);
        if self.comm.rank() != 0 {
            root.gather_varcount_into(local);
            return None;
        }
        let (counts, displs) = to_counts(table);
        let mut buf = vec![T::default(); table.total()];
        {
            let mut partition = PartitionMut::new(&mut buf[..], counts, displs);
            root.gather_varcount_into_root(local, &mut partition);
        }
        Some(buf)
    }

    fn scatter_varcount<T: Element>(&self, global: Option<&[T]>, table: &SegmentTable, out: &mut [T]) {
        let root = self.comm.process_at_rank(0);
        if self.comm.rank() != 0 {
            root.scatter_varcount_into(out);
            return;
        }
        let (counts, displs) = to_counts(table);
        let empty: Vec<T> = Vec::new();
        let global = global.unwrap_or(&empty[..]);
        let partition = Partition::new(global, counts, displs);
        root.scatter_varcount_into_root(&partition, out);
    }
}
