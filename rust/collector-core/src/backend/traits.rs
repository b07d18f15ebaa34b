// rust/collector-core/src/backend/traits.rs

//! Typed-I/O backend abstraction.
//!
//! The collector only needs a small capability set from the storage layer:
//! shared files addressed by path, a hierarchical namespace of groups,
//! datasets and links inside each file, block reads and writes of dataset
//! regions, and typed attributes. Any implementation providing these can be
//! plugged in as `Arc<dyn IoBackend>`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::datatype::{Attribute, DataType};
use crate::dimensions::Dimensions;
use crate::error::Result;

/// Access mode for opening an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Kind of an object in a file's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Group,
    Dataset,
    Link,
}

/// Shape and element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLayout {
    pub dtype: DataType,
    /// Number of meaningful axes (1..=3). Axes beyond the rank have extent 1.
    pub rank: u32,
    /// Global shape.
    pub shape: Dimensions,
    /// Whether the payload is stored compressed.
    pub compression: bool,
}

/// Strided sub-region of a dataset.
///
/// Selects `count[d]` elements along axis `d`, starting at `offset[d]` and
/// stepping by `stride[d]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub count: Dimensions,
    pub offset: Dimensions,
    pub stride: Dimensions,
}

impl Region {
    /// Contiguous region of `count` elements at `offset`.
    pub fn contiguous(count: Dimensions, offset: Dimensions) -> Self {
        Self {
            count,
            offset,
            stride: Dimensions::ones(),
        }
    }

    /// Smallest contiguous box enclosing every selected element.
    pub fn bounding_extent(&self) -> Dimensions {
        let mut extent = Dimensions::zero();
        for axis in 0..3 {
            extent[axis] = if self.count[axis] == 0 {
                0
            } else {
                (self.count[axis] - 1)
                    .saturating_mul(self.stride[axis].max(1))
                    .saturating_add(1)
            };
        }
        extent
    }

    /// Returns true if the region lies inside a dataset of `shape`.
    pub fn fits_in(&self, shape: Dimensions) -> bool {
        self.bounding_extent().fits_at(self.offset, &shape)
    }
}

/// Target of a namespace link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTarget {
    /// Iteration whose file holds the target.
    pub iteration: i32,
    /// Absolute path of the target dataset inside that file.
    pub path: String,
    /// Selected region, `None` for the whole dataset.
    pub region: Option<Region>,
}

/// A typed-I/O storage backend.
///
/// # Object Safety
///
/// This trait is object-safe and can be used with `Arc<dyn IoBackend>`.
pub trait IoBackend: Send + Sync {
    /// Creates (or truncates) the file at `path` and opens it read-write.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the file cannot be created.
    fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>>;

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the file is missing or unreadable.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>>;

    /// Checks whether a file exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Deletes the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the file cannot be deleted.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Lists the entry names of a directory, sorted. A missing directory is empty.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
}

/// An open file.
///
/// Paths inside the file are absolute, `/`-separated strings. Missing
/// parent groups are created implicitly by `create_group`,
/// `create_dataset` and `create_link`.
pub trait FileHandle: Send {
    /// Path of the physical file.
    fn path(&self) -> &Path;

    fn is_read_only(&self) -> bool;

    /// Creates a group and any missing ancestors. Existing groups are kept.
    fn create_group(&mut self, path: &str) -> Result<()>;

    /// Kind of the object at `path`, `None` if nothing is there.
    fn kind(&self, path: &str) -> Result<Option<ObjectKind>>;

    /// Names of the immediate children of a group, sorted.
    fn children(&self, group: &str) -> Result<Vec<String>>;

    /// Removes an object and everything below it.
    fn unlink(&mut self, path: &str) -> Result<()>;

    /// Creates a zero-filled dataset.
    fn create_dataset(&mut self, path: &str, layout: DatasetLayout) -> Result<()>;

    fn dataset_layout(&self, path: &str) -> Result<DatasetLayout>;

    /// Writes a contiguous block of `extent` elements at `offset`.
    ///
    /// `data` holds exactly `extent.product()` elements, axis 0 fastest.
    fn write_block(
        &mut self,
        path: &str,
        offset: Dimensions,
        extent: Dimensions,
        data: &[u8],
    ) -> Result<()>;

    /// Reads a contiguous block of `extent` elements at `offset`.
    fn read_block(&self, path: &str, offset: Dimensions, extent: Dimensions) -> Result<Vec<u8>>;

    fn create_link(&mut self, path: &str, target: LinkTarget) -> Result<()>;

    fn link_target(&self, path: &str) -> Result<LinkTarget>;

    /// Sets (or replaces) an attribute on an existing object.
    fn write_attribute(&mut self, object: &str, name: &str, value: Attribute) -> Result<()>;

    fn read_attribute(&self, object: &str, name: &str) -> Result<Attribute>;

    /// Persists pending changes without closing.
    fn flush(&mut self) -> Result<()>;

    /// Releases the handle, persisting pending changes.
    ///
    /// # Errors
    ///
    /// Returns a backend error if persisting fails.
    fn close(self: Box<Self>) -> Result<()>;
}
