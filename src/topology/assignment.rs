//! Pairing of node-local processes with node-local devices.
//!
//! When processes outnumber devices, the processes of a node are dealt out
//! in contiguous bands: the first `local_size % n_devs` devices get one extra
//! process. The lowest local rank of each band is the team lead.

use crate::error::{Result, TeamSolveError};

/// Device pairing of one node-local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAssignment {
    /// Node-local index of the device this process is paired with.
    pub device_index: usize,
    /// Whether this process drives the device on behalf of its team.
    pub is_team_lead: bool,
}

/// Compute the device pairing of node-local rank `local_rank`.
///
/// Pure function of its inputs. With `n_devs >= local_size` every process gets
/// its own device and leads it; surplus devices stay unused.
pub fn assign_device(n_devs: usize, local_size: usize, local_rank: usize) -> Result<DeviceAssignment> {
    if n_devs == 0 {
        return Err(TeamSolveError::Config("no devices to assign processes to".into()));
    }
    if local_rank >= local_size {
        return Err(TeamSolveError::Topology(format!(
            "local rank {local_rank} out of range for {local_size} node-local processes"
        )));
    }

    if n_devs >= local_size {
        return Ok(DeviceAssignment {
            device_index: local_rank,
            is_team_lead: true,
        });
    }

    let n_basic = local_size / n_devs;
    let n_remain = local_size % n_devs;
    // Ranks below this boundary sit in the wider (n_basic + 1) bands.
    let wide_band_end = (n_basic + 1) * n_remain;

    let (device_index, offset) = if local_rank < wide_band_end {
        (local_rank / (n_basic + 1), local_rank % (n_basic + 1))
    } else {
        let shifted = local_rank - wide_band_end;
        (shifted / n_basic + n_remain, shifted % n_basic)
    };

    Ok(DeviceAssignment {
        device_index,
        is_team_lead: offset == 0,
    })
}
