// rust/collector-core/src/collector/mod.rs

//! Collective checkpoint/restart collector.
//!
//! This module provides functionality for:
//! - Gathering global dataset geometry from per-process extents
//! - Writing strided or offset selections of local buffers
//! - Reading sub-selections into caller-provided buffers
//! - References between datasets of different iterations
//! - A bounded LRU cache of open iteration files
//!
//! # File Layout
//!
//! ```text
//! <base><id>.<ext>
//! ├── /header          format_version, iteration, mpi_topology, compression
//! ├── /custom          file-scoped user attributes
//! └── /data
//!     └── /<id>        iteration attributes
//!         └── <name>   datasets, groups and references
//! ```

mod engine;
mod gather;
mod handles;
mod naming;
mod parallel;
mod selection;

pub use gather::{compute_placement, GlobalGeometry};
pub use handles::{AccessMode, IterationIndex, FORMAT_VERSION};
pub use naming::{FileNaming, CUSTOM_GROUP, DATA_GROUP, HEADER_GROUP};
pub use parallel::{
    CollectorState, Entry, FileCreationAttr, ParallelDataCollector, ReadInfo, ReadOptions,
    WriteOptions,
};
pub use selection::MemoryLayout;
