// rust/collector-core/src/lib.rs

//! Parallel Data Collector - Core Library
//!
//! This crate stores the state of a distributed simulation as one file per
//! iteration, written collectively by every process of a group. It provides
//! collective geometry gathering, a typed-I/O storage backend, and the
//! [`ParallelDataCollector`] that ties them together.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{CollectorConfig, CompressionCodec};
pub use error::{CollectorError, ErrorKind, Result};

pub mod datatype;
pub mod dimensions;
pub use datatype::{Attribute, DataType, Element};
pub use dimensions::Dimensions;

pub mod comm;
pub mod topology;
pub use comm::{Communicator, LocalCommunicator, LocalGroup, SoloCommunicator};
#[cfg(feature = "mpi")]
pub use comm::MpiCommunicator;
pub use topology::ProcessTopology;

pub mod backend;
pub use backend::{IoBackend, LocalBackend, Region};

pub mod collector;
pub use collector::{
    AccessMode, CollectorState, Entry, FileCreationAttr, GlobalGeometry, MemoryLayout,
    ParallelDataCollector, ReadInfo, ReadOptions, WriteOptions,
};
