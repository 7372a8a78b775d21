use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use teamsolve::comm::{contiguous_nodes, ProcessGroup, ThreadGroup};
use teamsolve::engine::{EngineContext, HostEngine, SolveStatus};
use teamsolve::error::Result;
use teamsolve::parcsr::ParCsrMatrix;
use teamsolve::redistribute::block_range;
use teamsolve::solver::{DeviceRequest, TeamSolver};

/// Solve a 1-D Laplacian through device teams of simulated ranks
#[derive(Parser)]
#[command(name = "teamsolve", version)]
struct Cli {
    /// Solver config file (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Number of simulated ranks
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Number of simulated nodes the ranks are spread over
    #[arg(long, default_value_t = 1)]
    nodes: usize,

    /// Devices per node (default: visible devices, or node size in host modes)
    #[arg(long)]
    devices: Option<usize>,

    /// Global number of unknowns
    #[arg(long, default_value_t = 64)]
    rows: usize,

    /// Engine mode (dDDI or hDDI)
    #[arg(long, default_value = "hDDI")]
    mode: String,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,

    /// Run over the MPI world instead of simulated ranks
    #[cfg(feature = "distributed")]
    #[arg(long)]
    mpi: bool,
}

/// What rank 0 reports after the solve.
struct Report {
    status: SolveStatus,
    residual: f64,
    elapsed: f64,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if cli.ranks == 0 || cli.rows == 0 {
        eprintln!("Error: --ranks and --rows must be positive");
        std::process::exit(1);
    }

    #[cfg(feature = "distributed")]
    if cli.mpi {
        let Some(_universe) = mpi::initialize() else {
            eprintln!("Error: MPI initialization failed");
            std::process::exit(1);
        };
        let world = teamsolve::comm::MpiGroup::world();
        let devices = cli.devices.unwrap_or(0);
        match run_rank(&cli, &world, devices) {
            Ok(Some(report)) => print_report(&cli, &report),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error on rank {}: {}", world.rank(), e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Simulated accelerators: with --devices unset, device modes see one per node.
    let visible = cli.devices.unwrap_or(1);
    let nodes = contiguous_nodes(cli.ranks, cli.nodes);
    let results = ThreadGroup::run(&nodes, |group| run_rank(&cli, &group, visible));

    let mut failed = false;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(Some(report)) => print_report(&cli, &report),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error on rank {rank}: {e}");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn print_report(cli: &Cli, report: &Report) {
    println!(
        "rows={} ranks={} status={:?} residual={:.3e} time={:.3}s",
        cli.rows, cli.ranks, report.status, report.residual, report.elapsed
    );
}

/// One rank's share of the run; rank 0 returns the report.
fn run_rank<G: ProcessGroup>(cli: &Cli, group: &G, visible: usize) -> Result<Option<Report>> {
    let start = Instant::now();
    let context = EngineContext::new(HostEngine::<G>::with_visible_devices(visible));
    let mut solver = TeamSolver::new(context);

    let request = cli.devices.map_or(DeviceRequest::Auto, DeviceRequest::Exactly);
    solver.initialize(group, &cli.mode, &cli.config, request)?;

    let rows = block_range(cli.rows, group.size(), group.rank());
    let triplets = laplacian_rows(cli.rows, rows.clone());
    let matrix = ParCsrMatrix::from_global_triplets(
        cli.rows,
        cli.rows,
        rows.clone(),
        rows.clone(),
        &triplets,
    )?;
    solver.set_matrix(&matrix)?;

    let b = vec![1.0; rows.len()];
    let mut x = vec![0.0; rows.len()];
    let status = solver.solve(&mut x, &b)?;

    // Residual of the returned solution, assembled over all ranks.
    let mut full = vec![0.0; cli.rows];
    full[rows.clone()].copy_from_slice(&x);
    group.all_reduce_sum_vec(&mut full);
    let mut local_sq = 0.0;
    for (i, row) in rows.clone().enumerate() {
        let ax: f64 = triplets
            .iter()
            .filter(|&&(r, _, _)| r == row)
            .map(|&(_, c, v)| v * full[c])
            .sum();
        local_sq += (b[i] - ax).powi(2);
    }
    let residual = group.all_reduce_sum(local_sq).sqrt();

    if cli.stats && group.rank() == 0 {
        solver.stats().display();
    }
    solver.finalize()?;

    Ok((group.rank() == 0).then(|| Report {
        status,
        residual,
        elapsed: start.elapsed().as_secs_f64(),
    }))
}

/// Entries of the rows `rows` of the `n`-point 1-D Laplacian (2 on the
/// diagonal, -1 beside it).
fn laplacian_rows(n: usize, rows: std::ops::Range<usize>) -> Vec<(usize, usize, f64)> {
    let mut triplets = Vec::with_capacity(3 * rows.len());
    for r in rows {
        if r > 0 {
            triplets.push((r, r - 1, -1.0));
        }
        triplets.push((r, r, 2.0));
        if r + 1 < n {
            triplets.push((r, r + 1, -1.0));
        }
    }
    triplets
}
