// rust/collector-core/src/backend/mod.rs

//! Typed-I/O storage backends.
//!
//! The collector talks to storage through the [`IoBackend`] and
//! [`FileHandle`] traits. [`LocalBackend`] keeps one physical file per
//! iteration on the local filesystem.
//!
//! # Example
//!
//! ```no_run
//! use collector_core::backend::{DatasetLayout, IoBackend, LocalBackend, OpenMode};
//! use collector_core::{DataType, Dimensions};
//! use std::path::Path;
//!
//! let backend = LocalBackend::default();
//! let mut file = backend.create(Path::new("run0.h5")).unwrap();
//! file.create_dataset(
//!     "/data/0/x",
//!     DatasetLayout {
//!         dtype: DataType::Float64,
//!         rank: 1,
//!         shape: Dimensions::new(16, 1, 1),
//!         compression: false,
//!     },
//! )
//! .unwrap();
//! file.close().unwrap();
//!
//! let file = backend.open(Path::new("run0.h5"), OpenMode::ReadOnly).unwrap();
//! assert_eq!(file.dataset_layout("/data/0/x").unwrap().shape[0], 16);
//! ```

pub mod format;
mod local;
mod traits;

pub use local::{LocalBackend, LocalFileHandle};
pub use traits::{DatasetLayout, FileHandle, IoBackend, LinkTarget, ObjectKind, OpenMode, Region};
