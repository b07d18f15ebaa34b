// rust/collector-core/src/topology.rs

//! Process grid description derived once per collector.

use crate::comm::Communicator;
use crate::dimensions::{rank_to_position, Dimensions};
use crate::error::{CollectorError, Result};

/// Immutable per-run description of this process within the process grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTopology {
    /// Number of processes in the group.
    pub size: u64,
    /// Rank of this process.
    pub rank: u64,
    /// Process grid shape.
    pub grid: Dimensions,
    /// Position of this process in `grid`.
    pub position: Dimensions,
}

impl ProcessTopology {
    /// Builds the topology for `rank` of `size` processes arranged as `grid`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the grid has a zero axis or its
    /// product differs from the group size.
    pub fn new(rank: u64, size: u64, grid: Dimensions) -> Result<Self> {
        if grid.0.iter().any(|&axis| axis == 0) {
            return Err(CollectorError::config(format!(
                "process grid {grid} has a zero axis"
            )));
        }
        if grid.product() != size {
            return Err(CollectorError::config(format!(
                "process grid {grid} holds {} processes but the communicator has {size}",
                grid.product()
            )));
        }
        if rank >= size {
            return Err(CollectorError::config(format!(
                "rank {rank} out of range for {size} processes"
            )));
        }

        Ok(Self {
            size,
            rank,
            grid,
            position: rank_to_position(rank, grid),
        })
    }

    pub fn from_communicator(comm: &dyn Communicator, grid: Dimensions) -> Result<Self> {
        Self::new(comm.rank(), comm.size(), grid)
    }

    /// Position of an arbitrary rank in the grid.
    pub fn position_of(&self, rank: u64) -> Dimensions {
        rank_to_position(rank, self.grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloCommunicator;

    #[test]
    fn test_topology_position() {
        let topo = ProcessTopology::new(3, 4, Dimensions::new(2, 2, 1)).unwrap();
        assert_eq!(topo.position, Dimensions::new(1, 1, 0));
        assert_eq!(topo.position_of(2), Dimensions::new(0, 1, 0));
    }

    #[test]
    fn test_grid_must_match_size() {
        let err = ProcessTopology::new(0, 3, Dimensions::new(2, 1, 1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_zero_axis_rejected() {
        assert!(ProcessTopology::new(0, 0, Dimensions::new(0, 1, 1)).is_err());
    }

    #[test]
    fn test_from_solo_communicator() {
        let topo =
            ProcessTopology::from_communicator(&SoloCommunicator, Dimensions::ones()).unwrap();
        assert_eq!(topo.rank, 0);
        assert_eq!(topo.size, 1);
        assert_eq!(topo.position, Dimensions::zero());
    }
}
