//! Multi-process team solver tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use approx::assert_relative_eq;
use teamsolve::comm::{MpiGroup, ProcessGroup};
use teamsolve::engine::{EngineContext, HostEngine, SolveStatus};
use teamsolve::parcsr::ParCsrMatrix;
use teamsolve::redistribute::block_range;
use teamsolve::solver::{DeviceRequest, TeamSolver};

#[test]
fn distributed_diagonal_system() {
    let _universe = mpi::initialize().expect("MPI init failed");
    let world = MpiGroup::world();

    let config = std::env::temp_dir().join(format!("teamsolve-mpi-{}.toml", world.rank()));
    std::fs::write(&config, "[solver]\ntolerance = 1e-12\n").expect("failed to write config");

    let n = 8;
    let rows = block_range(n, world.size(), world.rank());
    let triplets: Vec<_> = rows.clone().map(|r| (r, r, (r + 1) as f64)).collect();
    let matrix = ParCsrMatrix::from_global_triplets(n, n, rows.clone(), rows.clone(), &triplets)
        .expect("matrix");

    let mut solver = TeamSolver::new(EngineContext::new(HostEngine::<MpiGroup>::new()));
    solver
        .initialize(&world, "hDDI", &config, DeviceRequest::Exactly(1))
        .expect("initialize failed");
    solver.set_matrix(&matrix).expect("set_matrix failed");

    let b = vec![1.0; rows.len()];
    let mut x = vec![0.0; rows.len()];
    let status = solver.solve(&mut x, &b).expect("solve failed");
    solver.finalize().expect("finalize failed");

    assert_eq!(status, SolveStatus::Success);
    for (row, value) in rows.zip(x) {
        assert_relative_eq!(value, 1.0 / (row + 1) as f64, max_relative = 1e-10);
    }
}
