//! Solver-engine call protocol and engine-global lifetime management.
//!
//! `SolverEngine` mirrors the fixed call sequence of a device-resident
//! algebraic solver library: one-time global startup, config load, resource
//! creation, distributed matrix upload with a row-partition table, vector
//! upload/download and a status-returning solve. Only device-team leads ever
//! call into an engine.
//!
//! `EngineContext` owns the engine plus the state shared by every solver
//! instance of a process: the instance count and the engine-global resource
//! object. Startup runs when the first engine user appears, teardown when the
//! last one leaves.

pub mod host;

use crate::comm::ProcessGroup;
use crate::error::{Result, TeamSolveError};
use crate::redistribute::RowPartition;
use crate::sparse::CsrMatrix;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

pub use host::HostEngine;

/// Precision and locality of the engine's matrix, vector and index data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Device-resident, double matrix, double vectors, 32-bit indices.
    DeviceDDI,
    /// Host-resident, double matrix, double vectors, 32-bit indices.
    HostDDI,
}

impl Mode {
    /// Whether data lives on an accelerator.
    pub fn is_device(self) -> bool {
        matches!(self, Mode::DeviceDDI)
    }

    pub fn tag(self) -> &'static str {
        match self {
            Mode::DeviceDDI => "dDDI",
            Mode::HostDDI => "hDDI",
        }
    }
}

impl FromStr for Mode {
    type Err = TeamSolveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dDDI" => Ok(Mode::DeviceDDI),
            "hDDI" => Ok(Mode::HostDDI),
            other => Err(TeamSolveError::Config(format!("mode {other:?} not supported"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Outcome reported by the engine after a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Success,
    Failed,
    Diverged,
    NotConverged,
}

impl SolveStatus {
    /// Numeric status code as reported by the engine.
    pub fn code(self) -> i64 {
        match self {
            SolveStatus::Success => 0,
            SolveStatus::Failed => 1,
            SolveStatus::Diverged => 2,
            SolveStatus::NotConverged => 3,
        }
    }

    /// Unknown codes map to `Failed`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => SolveStatus::Success,
            2 => SolveStatus::Diverged,
            3 => SolveStatus::NotConverged,
            _ => SolveStatus::Failed,
        }
    }

    pub fn is_success(self) -> bool {
        self == SolveStatus::Success
    }
}

/// Call protocol of a distributed solver engine.
///
/// Every failing call other than `solve`'s numerical outcome is fatal for
/// the calling instance. Handles are exclusively owned by the lead that
/// created them, except `Resources`, which is shared by all instances of a
/// process through `EngineContext`.
pub trait SolverEngine {
    /// Process group the engine communicates over (the solver-lead group).
    type Group: ProcessGroup;
    type Config;
    type Resources;
    type Matrix;
    type Vector;
    type Solver;

    /// Number of accelerators visible to this process.
    fn visible_devices(&self) -> Result<usize>;

    /// Engine-global initialization (library and plugins).
    fn startup(&self) -> Result<()>;

    /// Engine-global teardown.
    fn shutdown(&self) -> Result<()>;

    fn load_config(&self, path: &Path) -> Result<Self::Config>;

    fn destroy_config(&self, config: Self::Config) -> Result<()>;

    /// Default number of halo rings for the given configuration.
    fn default_rings(&self, config: &Self::Config) -> Result<usize>;

    fn create_resources(
        &self,
        config: &Self::Config,
        solver_group: &Self::Group,
        device: usize,
    ) -> Result<Self::Resources>;

    fn destroy_resources(&self, resources: Self::Resources) -> Result<()>;

    fn create_matrix(&self, resources: &Self::Resources, mode: Mode) -> Result<Self::Matrix>;

    fn destroy_matrix(&self, matrix: Self::Matrix) -> Result<()>;

    fn create_vector(&self, resources: &Self::Resources, mode: Mode) -> Result<Self::Vector>;

    fn destroy_vector(&self, vector: Self::Vector) -> Result<()>;

    fn create_solver(
        &self,
        resources: &Self::Resources,
        mode: Mode,
        config: &Self::Config,
    ) -> Result<Self::Solver>;

    fn destroy_solver(&self, solver: Self::Solver) -> Result<()>;

    /// Upload this team's rows (global column numbering) together with the
    /// offsets of every team's row range.
    fn upload_matrix(
        &self,
        matrix: &mut Self::Matrix,
        global_rows: usize,
        block: &CsrMatrix<f64>,
        partition: &RowPartition,
    ) -> Result<()>;

    /// Symbolic and numeric setup of `solver` for `matrix`.
    fn setup(&self, solver: &mut Self::Solver, matrix: &Self::Matrix) -> Result<()>;

    fn bind_vector(&self, vector: &mut Self::Vector, matrix: &Self::Matrix) -> Result<()>;

    fn upload_vector(&self, vector: &mut Self::Vector, data: &[f64]) -> Result<()>;

    fn download_vector(&self, vector: &Self::Vector, out: &mut [f64]) -> Result<()>;

    /// Run the solve. Collective over the solver group.
    fn solve(&self, solver: &mut Self::Solver, rhs: &Self::Vector, x: &mut Self::Vector) -> Result<()>;

    fn status(&self, solver: &Self::Solver) -> Result<SolveStatus>;
}

struct Registry<R> {
    instances: usize,
    users: usize,
    resources: Option<Arc<R>>,
    /// Size of the solver group the resources were created for.
    solver_size: usize,
}

/// Process-wide engine state shared by all solver instances.
pub struct EngineContext<E: SolverEngine> {
    engine: E,
    registry: Mutex<Registry<E::Resources>>,
}

impl<E: SolverEngine> EngineContext<E> {
    pub fn new(engine: E) -> Arc<Self> {
        Arc::new(Self {
            engine,
            registry: Mutex::new(Registry {
                instances: 0,
                users: 0,
                resources: None,
                solver_size: 0,
            }),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Initialized solver instances, leads or not.
    pub fn live_instances(&self) -> usize {
        self.lock().instances
    }

    /// Instances currently holding the engine-global resources.
    pub fn engine_users(&self) -> usize {
        self.lock().users
    }

    pub(crate) fn register(&self) -> usize {
        let mut registry = self.lock();
        registry.instances += 1;
        registry.instances
    }

    pub(crate) fn unregister(&self) {
        let mut registry = self.lock();
        registry.instances = registry.instances.saturating_sub(1);
    }

    /// Join the engine users; the first user starts the engine and creates
    /// the shared resources from its own config and solver group.
    ///
    /// Collective over `solver_group`. Instances may share the resources only
    /// when they have the same solver group; every lead of a mismatched group
    /// gets a `Topology` error.
    pub(crate) fn acquire(
        &self,
        config: &E::Config,
        solver_group: &E::Group,
        device: usize,
    ) -> Result<Arc<E::Resources>> {
        let held = {
            let registry = self.lock();
            registry.resources.as_ref().map(|_| registry.solver_size)
        };
        // Resource creation is collective, so either every lead reuses or none does.
        let holders = solver_group.all_reduce_sum_u64(u64::from(held.is_some()));
        let size_differs = held.is_some_and(|size| size != solver_group.size());
        let resized = solver_group.all_reduce_sum_u64(u64::from(size_differs));
        if resized > 0 || (holders > 0 && holders as usize != solver_group.size()) {
            return Err(TeamSolveError::Topology(format!(
                "engine resources are shared only by instances with the same device layout \
                 ({holders} of {} leads already hold resources)",
                solver_group.size()
            )));
        }

        let mut registry = self.lock();
        if let Some(resources) = &registry.resources {
            let resources = Arc::clone(resources);
            registry.users += 1;
            return Ok(resources);
        }

        tracing::info!(device, "starting solver engine");
        self.engine.startup()?;
        let resources = match self.engine.create_resources(config, solver_group, device) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                self.engine.shutdown()?;
                return Err(e);
            }
        };
        registry.resources = Some(Arc::clone(&resources));
        registry.solver_size = solver_group.size();
        registry.users = 1;
        Ok(resources)
    }

    /// Leave the engine users, handing back this instance's share of the
    /// resources. The last user destroys them and shuts the engine down;
    /// returns whether that happened.
    pub(crate) fn release(&self, resources: Arc<E::Resources>) -> Result<bool> {
        drop(resources);
        let mut registry = self.lock();
        registry.users = registry.users.saturating_sub(1);
        if registry.users > 0 {
            return Ok(false);
        }

        if let Some(shared) = registry.resources.take() {
            let owned = Arc::try_unwrap(shared).map_err(|_| {
                TeamSolveError::Engine("engine resources still referenced at teardown".into())
            })?;
            self.engine.destroy_resources(owned)?;
        }
        tracing::info!("shutting down solver engine");
        self.engine.shutdown()?;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<E::Resources>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
