//! Host-resident reference engine.
//!
//! Implements the engine call protocol on the CPU so that accelerator-less
//! runs and tests exercise the full upload/solve/download path. The solve is
//! a Jacobi right-preconditioned BiCGSTAB distributed over the solver-lead
//! group: dot products are summed with `all_reduce_sum`, and every SpMV
//! assembles the global iterate with `all_reduce_sum_vec`.

use super::{Mode, SolveStatus, SolverEngine};
use crate::comm::ProcessGroup;
use crate::error::{Result, TeamSolveError};
use crate::redistribute::RowPartition;
use crate::sparse::CsrMatrix;
use serde_derive::Deserialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const BREAKDOWN: f64 = 1e-30;

/// Solver settings read from the `[solver]` table of a TOML config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub max_iters: usize,
    /// Relative residual tolerance.
    pub tolerance: f64,
    pub rings: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            tolerance: 1e-10,
            rings: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub solver: SolverSettings,
}

impl HostConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(text)
            .map_err(|e| TeamSolveError::Config(format!("invalid solver config: {e}")))?;
        if config.solver.tolerance <= 0.0 || !config.solver.tolerance.is_finite() {
            return Err(TeamSolveError::Config(format!(
                "solver tolerance must be positive, got {}",
                config.solver.tolerance
            )));
        }
        Ok(config)
    }
}

/// Engine-global resources: a private copy of the solver-lead group.
pub struct HostResources<G> {
    group: Arc<G>,
}

pub struct HostMatrix<G> {
    group: Arc<G>,
    block: Option<CsrMatrix<f64>>,
    first_row: usize,
    global_rows: usize,
}

#[derive(Debug, Default)]
pub struct HostVector {
    data: Vec<f64>,
    bound_len: Option<usize>,
}

/// Matrix copy prepared for iteration: the team rows plus the inverse
/// diagonal used as the Jacobi preconditioner.
struct PreparedSystem {
    block: CsrMatrix<f64>,
    first_row: usize,
    global_rows: usize,
    inv_diag: Vec<f64>,
}

impl PreparedSystem {
    fn new(block: CsrMatrix<f64>, first_row: usize, global_rows: usize) -> Self {
        let inv_diag = (0..block.nrows)
            .map(|i| match block.get(i, first_row + i) {
                Some(d) if d.abs() > BREAKDOWN => 1.0 / d,
                _ => 1.0,
            })
            .collect();
        Self {
            block,
            first_row,
            global_rows,
            inv_diag,
        }
    }

    /// y = A * x for this team's rows. Collective over `group`.
    fn apply<G: ProcessGroup>(&self, group: &G, x: &[f64]) -> Vec<f64> {
        let mut global = vec![0.0; self.global_rows];
        global[self.first_row..self.first_row + x.len()].copy_from_slice(x);
        group.all_reduce_sum_vec(&mut global);
        self.block.spmv(&global)
    }

    fn precondition(&self, input: &[f64]) -> Vec<f64> {
        input
            .iter()
            .zip(&self.inv_diag)
            .map(|(v, d)| v * d)
            .collect()
    }
}

pub struct HostSolver<G> {
    group: Arc<G>,
    settings: SolverSettings,
    system: Option<PreparedSystem>,
    status: Option<SolveStatus>,
}

/// Reference engine running on the host CPU.
pub struct HostEngine<G> {
    visible_devices: usize,
    running: AtomicBool,
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
    _group: PhantomData<fn() -> G>,
}

impl<G> HostEngine<G> {
    /// An engine that sees no accelerators.
    pub fn new() -> Self {
        Self::with_visible_devices(0)
    }

    /// An engine reporting `n` visible accelerators for device modes.
    pub fn with_visible_devices(n: usize) -> Self {
        Self {
            visible_devices: n,
            running: AtomicBool::new(false),
            startups: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            _group: PhantomData,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn startup_count(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl<G> Default for HostEngine<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: ProcessGroup> SolverEngine for HostEngine<G> {
    type Group = G;
    type Config = HostConfig;
    type Resources = HostResources<G>;
    type Matrix = HostMatrix<G>;
    type Vector = HostVector;
    type Solver = HostSolver<G>;

    fn visible_devices(&self) -> Result<usize> {
        Ok(self.visible_devices)
    }

    fn startup(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TeamSolveError::Engine("engine already started".into()));
        }
        self.startups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(TeamSolveError::Engine("engine is not running".into()));
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_config(&self, path: &Path) -> Result<HostConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TeamSolveError::Config(format!("cannot read solver config {}: {e}", path.display()))
        })?;
        HostConfig::from_toml(&text)
    }

    fn destroy_config(&self, _config: HostConfig) -> Result<()> {
        Ok(())
    }

    fn default_rings(&self, config: &HostConfig) -> Result<usize> {
        Ok(config.solver.rings)
    }

    fn create_resources(&self, _config: &HostConfig, solver_group: &G, device: usize) -> Result<HostResources<G>> {
        if !self.is_running() {
            return Err(TeamSolveError::Engine("resources requested before startup".into()));
        }
        tracing::debug!(device, leads = solver_group.size(), "host engine resources created");
        Ok(HostResources {
            group: Arc::new(solver_group.duplicate()),
        })
    }

    fn destroy_resources(&self, _resources: HostResources<G>) -> Result<()> {
        Ok(())
    }

    fn create_matrix(&self, resources: &HostResources<G>, _mode: Mode) -> Result<HostMatrix<G>> {
        Ok(HostMatrix {
            group: Arc::clone(&resources.group),
            block: None,
            first_row: 0,
            global_rows: 0,
        })
    }

    fn destroy_matrix(&self, _matrix: HostMatrix<G>) -> Result<()> {
        Ok(())
    }

    fn create_vector(&self, _resources: &HostResources<G>, _mode: Mode) -> Result<HostVector> {
        Ok(HostVector::default())
    }

    fn destroy_vector(&self, _vector: HostVector) -> Result<()> {
        Ok(())
    }

    fn create_solver(&self, resources: &HostResources<G>, _mode: Mode, config: &HostConfig) -> Result<HostSolver<G>> {
        Ok(HostSolver {
            group: Arc::clone(&resources.group),
            settings: config.solver.clone(),
            system: None,
            status: None,
        })
    }

    fn destroy_solver(&self, _solver: HostSolver<G>) -> Result<()> {
        Ok(())
    }

    fn upload_matrix(
        &self,
        matrix: &mut HostMatrix<G>,
        global_rows: usize,
        block: &CsrMatrix<f64>,
        partition: &RowPartition,
    ) -> Result<()> {
        if block.ncols != global_rows {
            return Err(TeamSolveError::Engine(format!(
                "matrix is not square: {global_rows} rows, {} columns",
                block.ncols
            )));
        }
        if partition.total_rows() != global_rows || partition.n_teams() != matrix.group.size() {
            return Err(TeamSolveError::Engine(format!(
                "partition table {:?} does not describe {global_rows} rows over {} teams",
                partition.offsets(),
                matrix.group.size()
            )));
        }
        let range = partition.range(matrix.group.rank());
        if range.len() != block.nrows {
            return Err(TeamSolveError::Engine(format!(
                "team block has {} rows, partition assigns {}",
                block.nrows,
                range.len()
            )));
        }
        matrix.block = Some(block.clone());
        matrix.first_row = range.start;
        matrix.global_rows = global_rows;
        Ok(())
    }

    fn setup(&self, solver: &mut HostSolver<G>, matrix: &HostMatrix<G>) -> Result<()> {
        let block = matrix
            .block
            .clone()
            .ok_or_else(|| TeamSolveError::Engine("setup before matrix upload".into()))?;
        solver.system = Some(PreparedSystem::new(block, matrix.first_row, matrix.global_rows));
        solver.status = None;
        Ok(())
    }

    fn bind_vector(&self, vector: &mut HostVector, matrix: &HostMatrix<G>) -> Result<()> {
        let rows = matrix
            .block
            .as_ref()
            .map(|b| b.nrows)
            .ok_or_else(|| TeamSolveError::Engine("bind before matrix upload".into()))?;
        vector.bound_len = Some(rows);
        Ok(())
    }

    fn upload_vector(&self, vector: &mut HostVector, data: &[f64]) -> Result<()> {
        if let Some(len) = vector.bound_len {
            if len != data.len() {
                return Err(TeamSolveError::Engine(format!(
                    "vector upload of {} entries into a vector bound to {len} rows",
                    data.len()
                )));
            }
        }
        vector.data.clear();
        vector.data.extend_from_slice(data);
        Ok(())
    }

    fn download_vector(&self, vector: &HostVector, out: &mut [f64]) -> Result<()> {
        if out.len() != vector.data.len() {
            return Err(TeamSolveError::Engine(format!(
                "download of {} entries into a buffer of {}",
                vector.data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&vector.data);
        Ok(())
    }

    fn solve(&self, solver: &mut HostSolver<G>, rhs: &HostVector, x: &mut HostVector) -> Result<()> {
        let system = solver
            .system
            .as_ref()
            .ok_or_else(|| TeamSolveError::Engine("solve before setup".into()))?;
        let n = system.block.nrows;
        if rhs.data.len() != n || x.data.len() != n {
            return Err(TeamSolveError::Engine(format!(
                "solve with rhs of {} and x of {} entries for {n} rows",
                rhs.data.len(),
                x.data.len()
            )));
        }
        let (status, iterations) =
            bicgstab(system, solver.group.as_ref(), &rhs.data, &mut x.data, &solver.settings);
        tracing::debug!(?status, iterations, "host engine solve finished");
        solver.status = Some(status);
        Ok(())
    }

    fn status(&self, solver: &HostSolver<G>) -> Result<SolveStatus> {
        solver
            .status
            .ok_or_else(|| TeamSolveError::Engine("status requested before solve".into()))
    }
}

fn local_dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// y += alpha * x
fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// Distributed right-preconditioned BiCGSTAB starting from the guess in `x`.
///
/// Every branch depends only on all-reduced scalars, so all leads follow the
/// same path and issue the same collectives.
fn bicgstab<G: ProcessGroup>(
    system: &PreparedSystem,
    group: &G,
    b: &[f64],
    x: &mut [f64],
    settings: &SolverSettings,
) -> (SolveStatus, usize) {
    let dot = |u: &[f64], v: &[f64]| group.all_reduce_sum(local_dot(u, v));
    let n = b.len();

    let b_norm = dot(b, b).sqrt();
    if b_norm < BREAKDOWN {
        x.iter_mut().for_each(|v| *v = 0.0);
        return (SolveStatus::Success, 0);
    }
    let abs_tol = settings.tolerance * b_norm;

    // r = b - A * x
    let ax = system.apply(group, x);
    let mut r: Vec<f64> = b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect();
    if dot(&r, &r).sqrt() < abs_tol {
        return (SolveStatus::Success, 0);
    }
    let r_hat = r.clone();

    let mut p = vec![0.0; n];
    let mut v = vec![0.0; n];
    let mut rho: f64 = 1.0;
    let mut alpha: f64 = 1.0;
    let mut omega: f64 = 1.0;

    for iter in 0..settings.max_iters {
        let rho_new = dot(&r_hat, &r);
        if rho_new.abs() < BREAKDOWN {
            tracing::debug!(iter, "BiCGSTAB breakdown: rho ~ 0");
            return (SolveStatus::Failed, iter);
        }
        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;

        // p = r + beta * (p - omega * v)
        axpy(-omega, &v, &mut p);
        p.iter_mut().for_each(|pi| *pi *= beta);
        axpy(1.0, &r, &mut p);

        let p_hat = system.precondition(&p);
        v = system.apply(group, &p_hat);

        let r_hat_dot_v = dot(&r_hat, &v);
        if r_hat_dot_v.abs() < BREAKDOWN {
            tracing::debug!(iter, "BiCGSTAB breakdown: r_hat.v ~ 0");
            return (SolveStatus::Failed, iter);
        }
        alpha = rho / r_hat_dot_v;

        // s = r - alpha * v
        let mut s = r.clone();
        axpy(-alpha, &v, &mut s);

        let s_norm = dot(&s, &s).sqrt();
        if s_norm < abs_tol {
            axpy(alpha, &p_hat, x);
            return (SolveStatus::Success, iter + 1);
        }

        let s_hat = system.precondition(&s);
        let t = system.apply(group, &s_hat);

        let t_dot_s = dot(&t, &s);
        let t_dot_t = dot(&t, &t);
        if t_dot_t.abs() < BREAKDOWN {
            tracing::debug!(iter, "BiCGSTAB breakdown: ||t|| ~ 0");
            return (SolveStatus::Failed, iter);
        }
        omega = t_dot_s / t_dot_t;

        // x = x + alpha * p_hat + omega * s_hat
        axpy(alpha, &p_hat, x);
        axpy(omega, &s_hat, x);

        // r = s - omega * t
        r = s;
        axpy(-omega, &t, &mut r);

        let r_norm = dot(&r, &r).sqrt();
        if !r_norm.is_finite() {
            return (SolveStatus::Diverged, iter + 1);
        }
        if r_norm < abs_tol {
            return (SolveStatus::Success, iter + 1);
        }
        if omega.abs() < BREAKDOWN {
            tracing::debug!(iter, "BiCGSTAB breakdown: omega ~ 0");
            return (SolveStatus::Failed, iter + 1);
        }
    }

    (SolveStatus::NotConverged, settings.max_iters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadGroup;
    use approx::assert_abs_diff_eq;

    fn laplacian(n: usize) -> CsrMatrix<f64> {
        let mut t = Vec::new();
        for i in 0..n {
            if i > 0 {
                t.push((i, i - 1, -1.0));
            }
            t.push((i, i, 2.0));
            if i + 1 < n {
                t.push((i, i + 1, -1.0));
            }
        }
        CsrMatrix::from_triplets(n, n, &t)
    }

    fn solve_single(a: &CsrMatrix<f64>, b: &[f64], settings: SolverSettings) -> (Vec<f64>, SolveStatus) {
        let engine: HostEngine<ThreadGroup> = HostEngine::new();
        let group = ThreadGroup::single();
        let config = HostConfig { solver: settings };
        engine.startup().unwrap();
        let res = engine.create_resources(&config, &group, 0).unwrap();
        let mut m = engine.create_matrix(&res, Mode::HostDDI).unwrap();
        let mut s = engine.create_solver(&res, Mode::HostDDI, &config).unwrap();
        let mut x = engine.create_vector(&res, Mode::HostDDI).unwrap();
        let mut rhs = engine.create_vector(&res, Mode::HostDDI).unwrap();
        let partition = RowPartition::from_counts(&[a.nrows as u64]);
        engine.upload_matrix(&mut m, a.nrows, a, &partition).unwrap();
        engine.setup(&mut s, &m).unwrap();
        engine.bind_vector(&mut x, &m).unwrap();
        engine.bind_vector(&mut rhs, &m).unwrap();
        engine.upload_vector(&mut x, &vec![0.0; a.nrows]).unwrap();
        engine.upload_vector(&mut rhs, b).unwrap();
        engine.solve(&mut s, &rhs, &mut x).unwrap();
        let mut out = vec![0.0; a.nrows];
        engine.download_vector(&x, &mut out).unwrap();
        let status = engine.status(&s).unwrap();
        engine.shutdown().unwrap();
        (out, status)
    }

    #[test]
    fn solves_laplacian_to_tolerance() {
        let a = laplacian(12);
        let b = vec![1.0; 12];
        let (x, status) = solve_single(&a, &b, SolverSettings::default());
        assert_eq!(status, SolveStatus::Success);
        for (ri, bi) in a.spmv(&x).iter().zip(&b) {
            assert_abs_diff_eq!(ri, bi, epsilon = 1e-8);
        }
    }

    #[test]
    fn iteration_cap_reports_not_converged() {
        let a = laplacian(40);
        let b = vec![1.0; 40];
        let settings = SolverSettings {
            max_iters: 1,
            tolerance: 1e-14,
            rings: 1,
        };
        let (_, status) = solve_single(&a, &b, settings);
        assert_eq!(status, SolveStatus::NotConverged);
    }

    #[test]
    fn distributed_solve_matches_across_two_leads() {
        let n = 10;
        let a = laplacian(n);
        let results = ThreadGroup::run(&[0, 1], |group| {
            let rows = crate::redistribute::block_range(n, 2, group.rank());
            let start = rows.start;
            let triplets: Vec<_> = rows
                .clone()
                .flat_map(|r| a.row_range(r).map(move |k| (r - start, k)))
                .map(|(lr, k)| (lr, a.col_indices[k], a.values[k]))
                .collect();
            let block = CsrMatrix::from_triplets(rows.len(), n, &triplets);
            let partition = RowPartition::gather(&group, rows.len());
            let system = PreparedSystem::new(block, partition.range(group.rank()).start, n);
            let b = vec![1.0; rows.len()];
            let mut x = vec![0.0; rows.len()];
            let (status, _) = bicgstab(&system, &group, &b, &mut x, &SolverSettings::default());
            (status, x)
        });
        let x: Vec<f64> = results.iter().flat_map(|(_, x)| x.clone()).collect();
        assert!(results.iter().all(|(s, _)| s.is_success()));
        for (ri, bi) in a.spmv(&x).iter().zip(std::iter::repeat(1.0)) {
            assert_abs_diff_eq!(*ri, bi, epsilon = 1e-8);
        }
    }

    #[test]
    fn config_defaults_and_overrides() {
        let c = HostConfig::from_toml("[solver]\nmax_iters = 50\n").unwrap();
        assert_eq!(c.solver.max_iters, 50);
        assert_eq!(c.solver.rings, 1);
        assert!(HostConfig::from_toml("").is_ok());
        assert!(HostConfig::from_toml("[solver]\ntolerance = -1.0\n").is_err());
        assert!(HostConfig::from_toml("[solver\n").is_err());
    }

    #[test]
    fn double_startup_is_rejected() {
        let engine: HostEngine<ThreadGroup> = HostEngine::new();
        engine.startup().unwrap();
        assert!(engine.startup().is_err());
        engine.shutdown().unwrap();
        assert!(engine.shutdown().is_err());
        assert_eq!((engine.startup_count(), engine.shutdown_count()), (1, 1));
    }
}
