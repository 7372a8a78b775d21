//! Nested process-group hierarchy for device teams.
//!
//! From one caller-supplied group the builder derives:
//!
//! - `global`: a private duplicate of the caller's group
//! - `node`: processes sharing a node
//! - `team`: processes of one node paired with the same device; rank 0 leads
//! - `solver`: all team leads across all nodes (absent on non-leads)
//!
//! Every team member is a node member, every node member a global member, and
//! every solver-group member is rank 0 of its team.

pub mod assignment;

use crate::comm::ProcessGroup;
use crate::error::{Result, TeamSolveError};

pub use assignment::{assign_device, DeviceAssignment};

/// The four process groups of one solver instance and this process's place
/// in them.
pub struct Topology<G> {
    global: G,
    node: G,
    team: G,
    solver: Option<G>,
    assignment: DeviceAssignment,
    node_name: String,
    n_devices: usize,
}

impl<G: ProcessGroup> Topology<G> {
    /// Build the hierarchy over `group`.
    ///
    /// `resolve_devices` receives the node group and returns how many devices
    /// the node offers; it runs before any split keyed by the assignment.
    pub fn build(group: &G, resolve_devices: impl FnOnce(&G) -> Result<usize>) -> Result<Self> {
        let _span = tracing::debug_span!("build_topology").entered();

        let global = group.duplicate();
        let node = global.split_shared();
        let node_name = node.processor_name();

        let n_devices = resolve_devices(&node)?;
        if n_devices > node.size() {
            tracing::warn!(
                node = %node_name,
                devices = n_devices,
                processes = node.size(),
                "more devices than node-local processes; only {} will be used",
                node.size()
            );
        }
        let assignment = assign_device(n_devices, node.size(), node.rank())?;

        // Splits below are keyed by the assignment; every member must have
        // computed it before any of them enters a split.
        global.barrier();

        let solver = global.split(assignment.is_team_lead.then_some(0), global.rank());

        let device_color = u32::try_from(assignment.device_index).map_err(|_| {
            TeamSolveError::Topology(format!("device index {} too large", assignment.device_index))
        })?;
        let team = node.split(Some(device_color), node.rank()).ok_or_else(|| {
            TeamSolveError::Topology("device team split returned no group".into())
        })?;

        debug_assert_eq!(team.rank() == 0, assignment.is_team_lead);
        tracing::debug!(
            node = %node_name,
            global_rank = global.rank(),
            local_rank = node.rank(),
            device = assignment.device_index,
            lead = assignment.is_team_lead,
            team_size = team.size(),
            "device assignment"
        );

        Ok(Self {
            global,
            node,
            team,
            solver,
            assignment,
            node_name,
            n_devices,
        })
    }

    pub fn global(&self) -> &G {
        &self.global
    }

    pub fn node(&self) -> &G {
        &self.node
    }

    pub fn team(&self) -> &G {
        &self.team
    }

    /// The solver-lead group; `None` on processes that do not lead a team.
    pub fn solver(&self) -> Option<&G> {
        self.solver.as_ref()
    }

    pub fn device_index(&self) -> usize {
        self.assignment.device_index
    }

    pub fn is_team_lead(&self) -> bool {
        self.assignment.is_team_lead
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Device count the assignment was computed from.
    pub fn device_count(&self) -> usize {
        self.n_devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadGroup;

    #[test]
    fn single_node_two_devices() {
        let result = ThreadGroup::run(&[0, 0, 0, 0], |g| {
            let t = Topology::build(&g, |_| Ok(2)).unwrap();
            (
                t.device_index(),
                t.is_team_lead(),
                t.team().size(),
                t.team().rank(),
                t.solver().map(|s| (s.rank(), s.size())),
            )
        });
        assert_eq!(result[0], (0, true, 2, 0, Some((0, 2))));
        assert_eq!(result[1], (0, false, 2, 1, None));
        assert_eq!(result[2], (1, true, 2, 0, Some((1, 2))));
        assert_eq!(result[3], (1, false, 2, 1, None));
    }

    #[test]
    fn two_nodes_uneven_teams() {
        // Node 0 has three processes, node 1 has two; two devices each.
        let result = ThreadGroup::run(&[0, 0, 0, 1, 1], |g| {
            let t = Topology::build(&g, |_| Ok(2)).unwrap();
            (
                t.node().size(),
                t.team().size(),
                t.solver().map(|s| s.rank()),
                t.node_name().to_string(),
            )
        });
        assert_eq!(result[0], (3, 2, Some(0), "node0".into()));
        assert_eq!(result[1], (3, 2, None, "node0".into()));
        assert_eq!(result[2], (3, 1, Some(1), "node0".into()));
        assert_eq!(result[3], (2, 1, Some(2), "node1".into()));
        assert_eq!(result[4], (2, 1, Some(3), "node1".into()));
    }

    #[test]
    fn node_size_request_makes_every_process_a_lead() {
        let result = ThreadGroup::run(&[0, 0, 0], |g| {
            let t = Topology::build(&g, |node| Ok(node.size())).unwrap();
            (t.is_team_lead(), t.solver().map(|s| s.size()), t.device_count())
        });
        assert!(result.iter().all(|&(lead, size, n)| lead && size == Some(3) && n == 3));
    }

    #[test]
    fn resolve_error_is_propagated() {
        let g = ThreadGroup::single();
        let err = Topology::build(&g, |_| {
            Err(TeamSolveError::Config("no accelerators".into()))
        })
        .err()
        .unwrap();
        assert!(matches!(err, TeamSolveError::Config(_)));
    }
}
