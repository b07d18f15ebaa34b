// rust/collector-core/src/comm/mpi_comm.rs

//! `Communicator` over a real MPI communicator (feature `mpi`).

use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::*;

use super::traits::Communicator;
use crate::error::{CollectorError, Result};

/// Wraps an MPI communicator, typically `universe.world()`.
///
/// # Example
///
/// ```no_run
/// use collector_core::comm::MpiCommunicator;
///
/// let universe = mpi::initialize().unwrap();
/// let comm = MpiCommunicator::new(universe.world());
/// ```
pub struct MpiCommunicator {
    comm: SimpleCommunicator,
}

impl MpiCommunicator {
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// Duplicates `comm` so collector traffic cannot interleave with the caller's.
    pub fn duplicate(comm: &SimpleCommunicator) -> Self {
        Self {
            comm: comm.duplicate(),
        }
    }
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> u64 {
        self.comm.rank() as u64
    }

    fn size(&self) -> u64 {
        self.comm.size() as u64
    }

    fn all_gather(&self, local: &[u64]) -> Result<Vec<u64>> {
        let size = self.comm.size() as usize;

        // Agree on the contribution length first
        let local_len = local.len() as u64;
        let mut lengths = vec![0u64; size];
        self.comm.all_gather_into(&local_len, &mut lengths[..]);
        if lengths.iter().any(|&len| len != local_len) {
            return Err(CollectorError::backend(
                "<mpi>",
                format!("all_gather contributions differ in length: {lengths:?}"),
            ));
        }

        let mut gathered = vec![0u64; size * local.len()];
        if !local.is_empty() {
            self.comm.all_gather_into(local, &mut gathered[..]);
        }
        Ok(gathered)
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }
}
