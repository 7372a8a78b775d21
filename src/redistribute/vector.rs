//! Dense vector redistribution between process and team layouts.

use crate::comm::{ProcessGroup, SegmentTable};
use crate::error::{Result, TeamSolveError};

/// How a team's vector is split among its members.
///
/// Built once per matrix layout and reused across solves; a new layout is
/// needed whenever a member's local length changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorLayout {
    segments: SegmentTable,
    rank: usize,
}

impl VectorLayout {
    /// All-gather every member's local length.
    ///
    /// Collective over `team`.
    pub fn exchange_lengths<G: ProcessGroup>(team: &G, local_len: usize) -> Self {
        let counts = team.all_gather(local_len as u64);
        Self {
            segments: SegmentTable::from_counts(counts.iter().map(|&c| c as usize).collect()),
            rank: team.rank(),
        }
    }

    /// Reuse a segment table already agreed on by the team.
    pub fn from_segments(segments: SegmentTable, rank: usize) -> Self {
        Self { segments, rank }
    }

    /// Length of this member's segment.
    pub fn local_len(&self) -> usize {
        self.segments.counts()[self.rank]
    }

    /// Length of the concatenated team vector.
    pub fn team_len(&self) -> usize {
        self.segments.total()
    }

    /// Concatenate the team's segments on the lead, in team rank order.
    ///
    /// Collective over `team`. Returns `Some` on the lead only.
    pub fn gather<G: ProcessGroup>(&self, team: &G, local: &[f64]) -> Result<Option<Vec<f64>>> {
        self.check_local(local.len())?;
        Ok(team.gather_varcount(local, &self.segments))
    }

    /// Split the lead's team vector back into every member's `out`.
    ///
    /// Collective over `team`. Only the lead reads `team_vec`.
    pub fn scatter<G: ProcessGroup>(
        &self,
        team: &G,
        team_vec: Option<&[f64]>,
        out: &mut [f64],
    ) -> Result<()> {
        self.check_local(out.len())?;
        if team.is_root() {
            match team_vec {
                Some(v) if v.len() == self.team_len() => {}
                Some(v) => {
                    return Err(TeamSolveError::Dimension(format!(
                        "team vector has {} entries, layout expects {}",
                        v.len(),
                        self.team_len()
                    )))
                }
                None => {
                    return Err(TeamSolveError::Dimension(
                        "team lead has no vector to scatter".into(),
                    ))
                }
            }
        }
        team.scatter_varcount(team_vec, &self.segments, out);
        Ok(())
    }

    fn check_local(&self, len: usize) -> Result<()> {
        if len != self.local_len() {
            return Err(TeamSolveError::Dimension(format!(
                "local vector has {len} entries, layout expects {}",
                self.local_len()
            )));
        }
        Ok(())
    }
}
