//! Upload/solve/download driver for one solver instance.
//!
//! Lifecycle: `initialize` builds the process-group hierarchy and, on team
//! leads, the engine handles; `set_matrix` merges every team's rows onto its
//! lead and uploads them with the global row partition; `solve` gathers the
//! team's vectors, runs the engine and scatters the solution back;
//! `finalize` releases everything and leaves the instance ready for another
//! `initialize`.
//!
//! Every collective below is issued by all members of the group it addresses;
//! only engine calls are guarded by the lead check.

use crate::comm::ProcessGroup;
use crate::engine::{EngineContext, Mode, SolveStatus, SolverEngine};
use crate::error::{Result, TeamSolveError};
use crate::parcsr::ParCsrMatrix;
use crate::redistribute::{extract_local, merge_team, RowPartition, VectorLayout};
use crate::sparse::CsrMatrix;
use crate::stats::Stats;
use crate::topology::Topology;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many devices a node offers to the device assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Visible accelerators in device modes; node-local process count in
    /// host modes.
    Auto,
    /// A fixed count per node.
    Exactly(usize),
}

/// Engine handles owned by a team lead.
struct LeadHandles<E: SolverEngine> {
    resources: Arc<E::Resources>,
    config: E::Config,
    matrix: E::Matrix,
    rhs: E::Vector,
    solution: E::Vector,
    solver: E::Solver,
    rings: usize,
}

/// Layout of the matrix most recently passed to `set_matrix`.
struct LoadedSystem {
    layout: VectorLayout,
}

struct Instance<E: SolverEngine> {
    topology: Topology<E::Group>,
    lead: Option<LeadHandles<E>>,
    system: Option<LoadedSystem>,
}

/// Distributed solver instance mapping process rows onto device teams.
pub struct TeamSolver<E: SolverEngine> {
    context: Arc<EngineContext<E>>,
    instance: Option<Instance<E>>,
    stats: Stats,
}

impl<E: SolverEngine> TeamSolver<E> {
    /// An uninitialized instance sharing `context` with the process's other
    /// instances.
    pub fn new(context: Arc<EngineContext<E>>) -> Self {
        Self {
            context,
            instance: None,
            stats: Stats::new(),
        }
    }

    /// Build the process-group hierarchy over `group` and create the engine
    /// handles on team leads.
    ///
    /// Collective over `group`.
    pub fn initialize(
        &mut self,
        group: &E::Group,
        mode: &str,
        config_path: impl AsRef<Path>,
        devices: DeviceRequest,
    ) -> Result<()> {
        if self.instance.is_some() {
            return Err(TeamSolveError::Topology(
                "this solver instance has already been initialized".into(),
            ));
        }
        let config_path = config_path.as_ref();

        let start = Instant::now();
        let mode: Mode = mode.parse()?;
        let parse_time = start.elapsed();

        if !config_path.is_file() {
            return Err(TeamSolveError::Config(format!(
                "solver config {} does not exist",
                config_path.display()
            )));
        }

        let start = Instant::now();
        let engine = self.context.engine();
        let topology = Topology::build(group, |node| resolve_device_count(engine, mode, devices, node))?;
        let global_rank = topology.global().rank();
        record_phase(&mut self.stats, global_rank, "set mode", parse_time);
        record_phase(&mut self.stats, global_rank, "build topology", start.elapsed());

        self.context.register();

        let start = Instant::now();
        let lead = if topology.is_team_lead() {
            match open_lead(&self.context, mode, config_path, &topology) {
                Ok(handles) => Some(handles),
                Err(e) => {
                    self.context.unregister();
                    return Err(e);
                }
            }
        } else {
            None
        };
        record_phase(&mut self.stats, global_rank, "engine init", start.elapsed());

        tracing::debug!(
            %mode,
            devices = topology.device_count(),
            lead = topology.is_team_lead(),
            "solver instance initialized"
        );

        self.instance = Some(Instance {
            topology,
            lead,
            system: None,
        });
        Ok(())
    }

    /// Merge every team's rows onto its lead and upload them to the engine.
    ///
    /// Collective over the instance's global group.
    pub fn set_matrix(&mut self, matrix: &ParCsrMatrix) -> Result<()> {
        let instance = self.instance.as_mut().ok_or_else(not_initialized)?;
        let _span = tracing::info_span!("set_matrix", rows = matrix.local_rows()).entered();
        let start = Instant::now();

        let topology = &instance.topology;
        let team = topology.team();

        let local = extract_local(matrix);
        let merged = merge_team(team, &local)?;

        // A team with misordered rows must stop every team before the leads
        // meet in the solver group.
        let order = check_team_rows_contiguous(team, matrix, merged.rows.counts());
        let misordered = topology.global().all_reduce_sum_u64(u64::from(order.is_err()));
        order?;
        if misordered > 0 {
            return Err(TeamSolveError::Topology(format!(
                "rows of {misordered} process(es) in other teams do not follow team order"
            )));
        }

        let upload = match instance.lead.as_mut() {
            Some(handles) => upload_team_block(
                self.context.engine(),
                handles,
                topology,
                matrix,
                merged.block.as_ref(),
            ),
            None => Ok(()),
        };
        let mut verdict = [u64::from(upload.is_err())];
        team.broadcast(0, &mut verdict);
        upload?;
        if verdict[0] != 0 {
            return Err(TeamSolveError::Topology(
                "team lead rejected the team's rows".into(),
            ));
        }

        instance.system = Some(LoadedSystem {
            layout: VectorLayout::from_segments(merged.rows, team.rank()),
        });
        self.stats.matrix_uploads += 1;
        record_phase(&mut self.stats, topology.global().rank(), "set matrix", start.elapsed());
        Ok(())
    }

    /// Solve `A x = b` for the matrix last passed to `set_matrix`.
    ///
    /// `x` holds this process's segment of the initial guess on entry and of
    /// the solution on return. A non-success status is returned, not raised;
    /// `x` then holds whatever the engine produced. Collective over the
    /// instance's global group.
    pub fn solve(&mut self, x: &mut [f64], b: &[f64]) -> Result<SolveStatus> {
        let instance = self.instance.as_mut().ok_or_else(not_initialized)?;
        let system = instance.system.as_ref().ok_or_else(|| {
            TeamSolveError::Topology("solve called before set_matrix".into())
        })?;
        let topology = &instance.topology;
        let start = Instant::now();

        // Agree on input validity first so that no rank bails out of the
        // collectives below on its own.
        let expected = system.layout.local_len();
        let bad = x.len() != expected || b.len() != expected;
        let mismatches = topology.global().all_reduce_sum_u64(u64::from(bad));
        if mismatches > 0 {
            return Err(TeamSolveError::Dimension(format!(
                "vector lengths disagree with the matrix rows on {mismatches} process(es) \
                 (here: x = {}, b = {}, rows = {expected})",
                x.len(),
                b.len()
            )));
        }

        let team = topology.team();
        let mut team_x = system.layout.gather(team, x)?;
        let team_b = system.layout.gather(team, b)?;

        let mut code = [SolveStatus::Success.code()];
        if let (Some(handles), Some(tx), Some(tb)) =
            (instance.lead.as_mut(), team_x.as_mut(), team_b.as_ref())
        {
            let engine = self.context.engine();
            engine.upload_vector(&mut handles.solution, tx)?;
            engine.upload_vector(&mut handles.rhs, tb)?;
            engine.solve(&mut handles.solver, &handles.rhs, &mut handles.solution)?;
            let status = engine.status(&handles.solver)?;
            if !status.is_success() {
                tracing::warn!(
                    code = status.code(),
                    node = %topology.node_name(),
                    device = topology.device_index(),
                    "solver engine failed to solve the system"
                );
            }
            engine.download_vector(&handles.solution, tx)?;
            code[0] = status.code();
        }
        team.broadcast(0, &mut code);
        system.layout.scatter(team, team_x.as_deref(), x)?;

        let status = SolveStatus::from_code(code[0]);
        self.stats.solves += 1;
        if !status.is_success() {
            self.stats.failed_solves += 1;
        }
        record_phase(&mut self.stats, topology.global().rank(), "solve", start.elapsed());
        Ok(status)
    }

    /// Release this instance's engine handles and process groups.
    ///
    /// The last instance of the process to finalize also tears down the
    /// engine-global resources. Finalizing an uninitialized instance only
    /// logs a warning.
    pub fn finalize(&mut self) -> Result<()> {
        let Some(instance) = self.instance.take() else {
            tracing::warn!("finalize called on a solver instance that has not been initialized");
            return Ok(());
        };
        let Instance { topology, lead, .. } = instance;

        if let Some(handles) = lead {
            let engine = self.context.engine();
            let LeadHandles {
                resources,
                config,
                matrix,
                rhs,
                solution,
                solver,
                ..
            } = handles;
            engine.destroy_solver(solver)?;
            engine.destroy_matrix(matrix)?;
            engine.destroy_vector(solution)?;
            engine.destroy_vector(rhs)?;
            engine.destroy_config(config)?;
            if self.context.release(resources)? {
                tracing::debug!(node = %topology.node_name(), "engine-global resources released");
            } else {
                tracing::debug!(
                    remaining = self.context.engine_users(),
                    "engine still held by other instances"
                );
            }
        }

        drop(topology);
        self.context.unregister();
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.instance.is_some()
    }

    /// Device count the node's assignment was computed from.
    pub fn device_count(&self) -> Option<usize> {
        self.instance.as_ref().map(|i| i.topology.device_count())
    }

    /// Engine's default ring count; known on team leads only.
    pub fn rings(&self) -> Option<usize> {
        self.instance
            .as_ref()
            .and_then(|i| i.lead.as_ref())
            .map(|h| h.rings)
    }

    pub fn topology(&self) -> Option<&Topology<E::Group>> {
        self.instance.as_ref().map(|i| &i.topology)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn context(&self) -> &Arc<EngineContext<E>> {
        &self.context
    }
}

impl<E: SolverEngine> Drop for TeamSolver<E> {
    fn drop(&mut self) {
        if self.instance.is_some() {
            if let Err(e) = self.finalize() {
                tracing::error!(%e, "finalize on drop failed");
            }
        }
    }
}

/// Accumulate a phase duration; global rank 0 also logs it.
fn record_phase(stats: &mut Stats, global_rank: usize, name: &'static str, duration: Duration) {
    stats.add_phase(name, duration);
    if global_rank == 0 {
        tracing::info!(phase = name, seconds = duration.as_secs_f64(), "phase finished");
    }
}

fn not_initialized() -> TeamSolveError {
    TeamSolveError::Topology("solver instance has not been initialized".into())
}

fn missing_solver_group() -> TeamSolveError {
    TeamSolveError::Topology("team lead without a solver group".into())
}

fn resolve_device_count<E: SolverEngine>(
    engine: &E,
    mode: Mode,
    request: DeviceRequest,
    node: &E::Group,
) -> Result<usize> {
    let n = match request {
        DeviceRequest::Exactly(n) => n,
        DeviceRequest::Auto if mode.is_device() => engine.visible_devices()?,
        DeviceRequest::Auto => node.size(),
    };
    if n == 0 {
        return Err(TeamSolveError::Config(format!(
            "no accelerator devices on node {}",
            node.processor_name()
        )));
    }
    Ok(n)
}

fn open_lead<E: SolverEngine>(
    context: &EngineContext<E>,
    mode: Mode,
    config_path: &Path,
    topology: &Topology<E::Group>,
) -> Result<LeadHandles<E>> {
    let engine = context.engine();
    let solver_group = topology.solver().ok_or_else(missing_solver_group)?;

    let config = engine.load_config(config_path)?;
    let resources = context.acquire(&config, solver_group, topology.device_index())?;

    let solution = engine.create_vector(&resources, mode)?;
    let rhs = engine.create_vector(&resources, mode)?;
    let matrix = engine.create_matrix(&resources, mode)?;
    let solver = engine.create_solver(&resources, mode, &config)?;
    let rings = engine.default_rings(&config)?;

    Ok(LeadHandles {
        resources,
        config,
        matrix,
        rhs,
        solution,
        solver,
        rings,
    })
}

/// Team members must own consecutive global rows in team rank order.
///
/// Collective over `team`; every member reaches the same verdict.
fn check_team_rows_contiguous<G: ProcessGroup>(
    team: &G,
    matrix: &ParCsrMatrix,
    row_counts: &[usize],
) -> Result<()> {
    let starts = team.all_gather(matrix.row_range().start as u64);
    for member in 1..starts.len() {
        let expected = starts[member - 1] + row_counts[member - 1] as u64;
        if starts[member] != expected {
            return Err(TeamSolveError::Topology(format!(
                "team member {member} starts at row {}, expected {expected}",
                starts[member]
            )));
        }
    }
    Ok(())
}

fn upload_team_block<E: SolverEngine>(
    engine: &E,
    handles: &mut LeadHandles<E>,
    topology: &Topology<E::Group>,
    matrix: &ParCsrMatrix,
    block: Option<&CsrMatrix<f64>>,
) -> Result<()> {
    let block = block.ok_or_else(|| {
        TeamSolveError::Topology("team lead received no merged block".into())
    })?;
    let solver_group = topology.solver().ok_or_else(missing_solver_group)?;
    let partition = RowPartition::gather(solver_group, block.nrows);
    let team_start = partition.range(solver_group.rank()).start;
    let misplaced =
        team_start != matrix.row_range().start || partition.total_rows() != matrix.global_rows();
    if solver_group.all_reduce_sum_u64(u64::from(misplaced)) > 0 {
        return Err(TeamSolveError::Topology(format!(
            "team rows do not follow solver-group order: partition {:?}, this team starts at row {}, \
             matrix has {} rows",
            partition.offsets(),
            matrix.row_range().start,
            matrix.global_rows()
        )));
    }

    engine.upload_matrix(&mut handles.matrix, matrix.global_rows(), block, &partition)?;
    engine.setup(&mut handles.solver, &handles.matrix)?;
    engine.bind_vector(&mut handles.solution, &handles.matrix)?;
    engine.bind_vector(&mut handles.rhs, &handles.matrix)?;
    tracing::debug!(
        team_rows = block.nrows,
        team_nnz = block.nnz(),
        first_row = team_start,
        "team block uploaded"
    );
    Ok(())
}
