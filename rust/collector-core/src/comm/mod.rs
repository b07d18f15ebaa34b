// rust/collector-core/src/comm/mod.rs

//! Collective communication backends.
//!
//! The collector only needs group membership, a rank-ordered all-gather and
//! a barrier. Three implementations are provided:
//!
//! - [`SoloCommunicator`]: a group of one, for serial runs.
//! - [`LocalGroup`]: threads of one process acting as ranks.
//! - `MpiCommunicator` (feature `mpi`): a real MPI communicator.

mod local;
mod traits;

pub use local::{LocalCommunicator, LocalGroup};
pub use traits::{Communicator, SoloCommunicator};

#[cfg(feature = "mpi")]
mod mpi_comm;

#[cfg(feature = "mpi")]
pub use mpi_comm::MpiCommunicator;
