// rust/collector-core/src/comm/traits.rs

//! Collective communication abstraction.

use crate::error::Result;

/// Group membership and collective primitives used by the collector.
///
/// Every collective method must be called by all processes of the group in
/// the same relative order; a process that skips one leaves its peers
/// blocked. Implementations are not required to be thread-safe or `Send`:
/// one handle is used by exactly one thread of execution.
pub trait Communicator {
    /// Rank of the calling process, in `0..size()`.
    fn rank(&self) -> u64;

    /// Number of processes in the group.
    fn size(&self) -> u64;

    /// Gathers `local` from every process.
    ///
    /// Returns the concatenation of all contributions ordered by rank
    /// (rank 0 first), independent of arrival order. Every process must
    /// contribute the same number of values.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or contributions differ in length.
    fn all_gather(&self, local: &[u64]) -> Result<Vec<u64>>;

    /// Blocks until every process in the group has entered the barrier.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    fn barrier(&self) -> Result<()>;
}

/// Single-process group: rank 0 of size 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloCommunicator;

impl Communicator for SoloCommunicator {
    fn rank(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        1
    }

    fn all_gather(&self, local: &[u64]) -> Result<Vec<u64>> {
        Ok(local.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
