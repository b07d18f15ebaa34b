// rust/collector-core/src/collector/engine.rs

//! Dataset I/O against one open file.
//!
//! Functions here never communicate; the orchestrator gathers geometry and
//! synchronizes around them.

use tracing::debug;

use super::gather::GlobalGeometry;
use super::selection::{self, MemoryLayout};
use crate::backend::{DatasetLayout, FileHandle, ObjectKind, Region};
use crate::datatype::{Attribute, DataType};
use crate::dimensions::{Dimensions, MAX_RANK};
use crate::error::{CollectorError, ErrorKind, Result};

/// Name of the attribute recording a dataset's global shape.
pub const SIZE_ATTRIBUTE: &str = "_size";

/// Checks that `rank` is a supported dataset rank.
pub fn check_rank(rank: u32) -> Result<()> {
    if rank == 0 || rank > MAX_RANK {
        return Err(CollectorError::geometry(format!(
            "dataset rank {rank} outside 1..={MAX_RANK}"
        )));
    }
    Ok(())
}

/// Makes sure a dataset with `layout` exists at `path`.
///
/// A missing dataset is created together with its size attribute; an
/// existing one must match rank, type and (unless `check_shape` is false)
/// shape.
///
/// # Errors
///
/// Returns `SchemaMismatch` if an incompatible object already occupies `path`.
pub fn ensure_dataset(
    handle: &mut dyn FileHandle,
    path: &str,
    layout: DatasetLayout,
    check_shape: bool,
) -> Result<()> {
    match handle.kind(path)? {
        Some(ObjectKind::Dataset) => {
            check_layout(path, &handle.dataset_layout(path)?, &layout, check_shape)
        }
        Some(kind) => Err(CollectorError::schema(
            path,
            format!("a {kind:?} already exists at this name"),
        )),
        None => match handle.create_dataset(path, layout) {
            Ok(()) => {
                debug!(path, shape = %layout.shape, dtype = %layout.dtype, "Created dataset");
                handle.write_attribute(
                    path,
                    SIZE_ATTRIBUTE,
                    Attribute::from_values(&[layout.shape])?,
                )
            }
            // Another process of the group created it first.
            Err(e) if e.kind() == ErrorKind::SchemaMismatch
                && handle.kind(path)? == Some(ObjectKind::Dataset) =>
            {
                check_layout(path, &handle.dataset_layout(path)?, &layout, check_shape)
            }
            Err(e) => Err(e),
        },
    }
}

fn check_layout(
    path: &str,
    existing: &DatasetLayout,
    wanted: &DatasetLayout,
    check_shape: bool,
) -> Result<()> {
    if existing.rank != wanted.rank {
        return Err(CollectorError::schema(
            path,
            format!("rank {} does not match stored rank {}", wanted.rank, existing.rank),
        ));
    }
    if existing.dtype != wanted.dtype {
        return Err(CollectorError::schema(
            path,
            format!("type {} does not match stored type {}", wanted.dtype, existing.dtype),
        ));
    }
    if check_shape && existing.shape != wanted.shape {
        return Err(CollectorError::schema(
            path,
            format!(
                "shape {} does not match stored shape {}",
                wanted.shape, existing.shape
            ),
        ));
    }
    Ok(())
}

/// Writes the selected part of `data` into the dataset at `path`, placed at
/// `geometry.offset` inside a dataset of shape `geometry.size`.
///
/// `layout` must be resolved for `rank`. A write whose global size is empty
/// only makes sure the dataset exists and leaves stored data untouched.
#[allow(clippy::too_many_arguments)]
pub fn write_dataset(
    handle: &mut dyn FileHandle,
    path: &str,
    dtype: DataType,
    rank: u32,
    compression: bool,
    geometry: GlobalGeometry,
    layout: &MemoryLayout,
    data: &[u8],
) -> Result<()> {
    check_rank(rank)?;
    let size = geometry.size.normalized(rank, 1);
    let offset = geometry.offset.normalized(rank, 0);
    let wanted = DatasetLayout {
        dtype,
        rank,
        shape: size,
        compression,
    };

    if size.product() == 0 {
        if handle.kind(path)? == Some(ObjectKind::Dataset) {
            return check_layout(path, &handle.dataset_layout(path)?, &wanted, false);
        }
        return ensure_dataset(handle, path, wanted, false);
    }

    if layout.extent.product() > 0 && !layout.extent.fits_at(offset, &size) {
        return Err(CollectorError::geometry(format!(
            "offset {offset} with extent {} exceeds global size {size} of '{path}'",
            layout.extent
        )));
    }

    ensure_dataset(handle, path, wanted, true)?;
    if layout.extent.product() == 0 {
        return Ok(());
    }

    let block = selection::pack(data, dtype.size(), layout)?;
    handle.write_block(path, offset, layout.extent, &block)
}

/// Where the data of a name actually lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A dataset in the same file.
    Dataset,
    /// A reference to another (possibly the same) iteration.
    Reference(crate::backend::LinkTarget),
}

/// Classifies the object at `path`.
///
/// # Errors
///
/// Returns `NotFound` if nothing exists at `path` or it is a group.
pub fn resolve(handle: &dyn FileHandle, path: &str) -> Result<Source> {
    match handle.kind(path)? {
        Some(ObjectKind::Dataset) => Ok(Source::Dataset),
        Some(ObjectKind::Link) => Ok(Source::Reference(handle.link_target(path)?)),
        _ => Err(CollectorError::not_found(format!("dataset '{path}'"))),
    }
}

/// Resolved source selection of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlan {
    pub layout: DatasetLayout,
    /// Logical shape seen by the reader (region count for references).
    pub logical: Dimensions,
    pub src_extent: Dimensions,
    pub src_offset: Dimensions,
}

/// Applies read defaults: a zero `src_extent` reads everything from
/// `src_offset` to the end of the logical shape.
///
/// # Errors
///
/// Returns `GeometryMismatch` if the selection exceeds the logical shape.
pub fn plan_read(
    layout: DatasetLayout,
    region: Option<&Region>,
    src_extent: Dimensions,
    src_offset: Dimensions,
) -> Result<ReadPlan> {
    let rank = layout.rank;
    let logical = match region {
        Some(region) => region.count.normalized(rank, 1),
        None => layout.shape,
    };
    let src_offset = src_offset.normalized(rank, 0);
    let src_extent = if src_extent.is_zero() {
        logical - src_offset
    } else {
        src_extent.normalized(rank, 1)
    };

    if src_extent.product() > 0 && !src_extent.fits_at(src_offset, &logical) {
        return Err(CollectorError::geometry(format!(
            "read of extent {src_extent} at offset {src_offset} exceeds dataset shape {logical}"
        )));
    }

    Ok(ReadPlan {
        layout,
        logical,
        src_extent,
        src_offset,
    })
}

/// Reads the planned selection of the dataset at `path` as a contiguous
/// block, applying the reference `region` if any.
pub fn read_block(
    handle: &dyn FileHandle,
    path: &str,
    plan: &ReadPlan,
    region: Option<&Region>,
) -> Result<Vec<u8>> {
    let extent = plan.src_extent;
    match region {
        None => handle.read_block(path, plan.src_offset, extent),
        Some(region) => {
            let mut stride = region.stride;
            let mut start = region.offset;
            for axis in 0..3 {
                stride[axis] = stride[axis].max(1);
                start[axis] += plan.src_offset[axis] * stride[axis];
            }
            let bounding = Region {
                count: extent,
                offset: start,
                stride,
            }
            .bounding_extent();

            let raw = handle.read_block(path, start, bounding)?;
            let picked = MemoryLayout {
                extent,
                buffer: bounding,
                offset: Dimensions::zero(),
                stride,
            };
            selection::pack(&raw, plan.layout.dtype.size(), &picked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IoBackend, LocalBackend};
    use tempfile::TempDir;

    fn d(x: u64, y: u64, z: u64) -> Dimensions {
        Dimensions::new(x, y, z)
    }

    fn open(temp_dir: &TempDir) -> Box<dyn FileHandle> {
        LocalBackend::default()
            .create(&temp_dir.path().join("engine.h5"))
            .unwrap()
    }

    fn write_u32(
        handle: &mut dyn FileHandle,
        rank: u32,
        geometry: GlobalGeometry,
        layout: MemoryLayout,
        values: &[u32],
    ) -> Result<()> {
        let layout = layout.resolve(rank)?;
        write_dataset(
            handle,
            "/d",
            DataType::UInt32,
            rank,
            false,
            geometry,
            &layout,
            bytemuck::cast_slice(values),
        )
    }

    #[test]
    fn test_write_records_size_attribute() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = open(&temp_dir);
        let geometry = GlobalGeometry::new(d(4, 2, 1), d(0, 0, 0));
        write_u32(handle.as_mut(), 2, geometry, MemoryLayout::contiguous(d(4, 2, 1)), &[7; 8])
            .unwrap();

        let size: Vec<Dimensions> = handle
            .read_attribute("/d", SIZE_ATTRIBUTE)
            .unwrap()
            .values(SIZE_ATTRIBUTE)
            .unwrap();
        assert_eq!(size, vec![d(4, 2, 1)]);
    }

    #[test]
    fn test_schema_mismatch_on_rank_and_type() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = open(&temp_dir);
        let geometry = GlobalGeometry::new(d(4, 1, 1), d(0, 0, 0));
        write_u32(handle.as_mut(), 1, geometry, MemoryLayout::contiguous(d(4, 1, 1)), &[1; 4])
            .unwrap();
        // Same schema again is fine
        write_u32(handle.as_mut(), 1, geometry, MemoryLayout::contiguous(d(4, 1, 1)), &[2; 4])
            .unwrap();

        let err = write_u32(
            handle.as_mut(),
            2,
            GlobalGeometry::new(d(4, 1, 1), d(0, 0, 0)),
            MemoryLayout::contiguous(d(4, 1, 1)),
            &[1; 4],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);

        let layout = MemoryLayout::contiguous(d(4, 1, 1)).resolve(1).unwrap();
        let err = write_dataset(
            handle.as_mut(),
            "/d",
            DataType::Float32,
            1,
            false,
            geometry,
            &layout,
            &[0; 16],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_zero_extent_keeps_contents() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = open(&temp_dir);
        let geometry = GlobalGeometry::new(d(3, 1, 1), d(0, 0, 0));
        write_u32(handle.as_mut(), 1, geometry, MemoryLayout::contiguous(d(3, 1, 1)), &[5, 6, 7])
            .unwrap();
        write_u32(
            handle.as_mut(),
            1,
            GlobalGeometry::default(),
            MemoryLayout::contiguous(d(0, 0, 0)),
            &[],
        )
        .unwrap();

        let bytes = handle.read_block("/d", d(0, 0, 0), d(3, 1, 1)).unwrap();
        let values: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(values, vec![5, 6, 7]);
    }

    #[test]
    fn test_explicit_geometry_overrun() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = open(&temp_dir);
        let err = write_u32(
            handle.as_mut(),
            1,
            GlobalGeometry::new(d(4, 1, 1), d(2, 0, 0)),
            MemoryLayout::contiguous(d(3, 1, 1)),
            &[1, 2, 3],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryMismatch);
        assert_eq!(handle.kind("/d").unwrap(), None);
    }

    #[test]
    fn test_invalid_rank() {
        assert_eq!(check_rank(0).unwrap_err().kind(), ErrorKind::GeometryMismatch);
        assert_eq!(check_rank(4).unwrap_err().kind(), ErrorKind::GeometryMismatch);
        assert!(check_rank(3).is_ok());
    }

    #[test]
    fn test_plan_read_defaults() {
        let layout = DatasetLayout {
            dtype: DataType::Int8,
            rank: 2,
            shape: d(8, 4, 1),
            compression: false,
        };
        let plan = plan_read(layout, None, Dimensions::zero(), d(2, 1, 0)).unwrap();
        assert_eq!(plan.src_extent, d(6, 3, 1));

        let err = plan_read(layout, None, d(7, 1, 1), d(2, 0, 0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryMismatch);
    }

    #[test]
    fn test_read_through_region() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = open(&temp_dir);
        let values: Vec<u32> = (0..10).collect();
        write_u32(
            handle.as_mut(),
            1,
            GlobalGeometry::new(d(10, 1, 1), d(0, 0, 0)),
            MemoryLayout::contiguous(d(10, 1, 1)),
            &values,
        )
        .unwrap();

        let region = Region {
            count: d(4, 1, 1),
            offset: d(1, 0, 0),
            stride: d(2, 1, 1),
        };
        let layout = handle.dataset_layout("/d").unwrap();
        let plan = plan_read(layout, Some(&region), Dimensions::zero(), d(1, 0, 0)).unwrap();
        assert_eq!(plan.src_extent, d(3, 1, 1));

        let bytes = read_block(&*handle, "/d", &plan, Some(&region)).unwrap();
        let read: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(read, vec![3, 5, 7]);
    }
}
