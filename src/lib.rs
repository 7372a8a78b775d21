//! Topology and redistribution layer between a distributed CPU sparse matrix
//! and a smaller set of device-resident solver instances.
//!
//! Processes are grouped into device teams (one lead per accelerator). Each
//! team's rows are merged onto its lead, uploaded to the solver engine, and
//! solution vectors are scattered back to the per-process layout.

pub mod comm;
pub mod engine;
pub mod error;
pub mod parcsr;
pub mod redistribute;
pub mod solver;
pub mod sparse;
pub mod stats;
pub mod topology;
