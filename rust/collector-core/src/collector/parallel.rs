// rust/collector-core/src/collector/parallel.rs

//! The parallel data collector.
//!
//! A `ParallelDataCollector` is one process's view of a storage session
//! shared by a group of processes. Each iteration is one file shared by the
//! whole group; every process writes its part of a dataset and the
//! collector works out where that part goes.
//!
//! # Collective operations
//!
//! Writes with gathered geometry, `reserve`, `remove`, `remove_dataset`,
//! `create_reference`, collective reads and `close` must be called by every
//! process of the group in the same order. Opening or creating an iteration
//! file in a writing mode is collective as well, so the first access to an
//! iteration must also happen on every process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use collector_core::{
//!     CollectorConfig, Dimensions, FileCreationAttr, LocalBackend, ParallelDataCollector,
//!     ReadOptions, SoloCommunicator, WriteOptions,
//! };
//!
//! let mut collector = ParallelDataCollector::new(
//!     Box::new(SoloCommunicator),
//!     Arc::new(LocalBackend::default()),
//!     CollectorConfig::default(),
//! )
//! .unwrap();
//!
//! collector.open("out/run_", FileCreationAttr::create()).unwrap();
//! let field = vec![1.0f64; 16];
//! let opts = WriteOptions::new(2, Dimensions::new(4, 4, 1));
//! collector.write(0, "field", &opts, &field).unwrap();
//! collector.close().unwrap();
//!
//! collector.open("out/run_", FileCreationAttr::read()).unwrap();
//! let mut back = vec![0.0f64; 16];
//! let info = collector
//!     .read(0, "field", &ReadOptions::default(), Some(&mut back[..]))
//!     .unwrap();
//! assert_eq!(info.size_read, Dimensions::new(4, 4, 1));
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::engine::{self, Source};
use super::gather::{gather, GlobalGeometry};
use super::handles::{AccessMode, FileHeader, HandleCache, IterationIndex, Participation};
use super::naming::{data_path, iteration_group, FileNaming, CUSTOM_GROUP};
use super::selection::{check_buffer_len, scatter, MemoryLayout};
use crate::backend::{DatasetLayout, FileHandle, IoBackend, LinkTarget, ObjectKind, Region};
use crate::comm::Communicator;
use crate::config::CollectorConfig;
use crate::datatype::{Attribute, DataType, Element};
use crate::dimensions::Dimensions;
use crate::error::{CollectorError, Result};
use crate::topology::ProcessTopology;

/// Lifecycle state of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Closed,
    Creating,
    Writing,
    Reading,
}

/// Options for [`ParallelDataCollector::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCreationAttr {
    pub mode: AccessMode,
    /// Overrides `enable_compression` from the configuration.
    pub enable_compression: Option<bool>,
}

impl Default for FileCreationAttr {
    fn default() -> Self {
        Self::create()
    }
}

impl FileCreationAttr {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            enable_compression: None,
        }
    }

    pub fn create() -> Self {
        Self::new(AccessMode::Create)
    }

    pub fn write() -> Self {
        Self::new(AccessMode::Write)
    }

    pub fn read() -> Self {
        Self::new(AccessMode::Read)
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = Some(enabled);
        self
    }
}

/// How a write selects its data and where it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Dataset rank (1..=3).
    pub rank: u32,
    /// Selection inside the local buffer.
    pub layout: MemoryLayout,
    /// Explicit global placement. `None` gathers it from all processes.
    pub geometry: Option<GlobalGeometry>,
}

impl WriteOptions {
    /// Whole contiguous buffer of `extent` elements, placement gathered.
    pub fn new(rank: u32, extent: Dimensions) -> Self {
        Self {
            rank,
            layout: MemoryLayout::contiguous(extent),
            geometry: None,
        }
    }

    #[must_use]
    pub fn with_layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Places the data at `offset` of a dataset of shape `size` without
    /// gathering. Every process must pass the same `size`.
    #[must_use]
    pub fn with_geometry(mut self, size: Dimensions, offset: Dimensions) -> Self {
        self.geometry = Some(GlobalGeometry::new(size, offset));
        self
    }
}

/// Source and destination selection of a read. Zero fields take defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Elements to read; zero reads up to the end of the dataset.
    pub src_extent: Dimensions,
    pub src_offset: Dimensions,
    /// Shape of the destination buffer; zero means "just large enough".
    pub dst_buffer: Dimensions,
    pub dst_offset: Dimensions,
    /// Whether every process takes part in the read.
    pub collective: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            src_extent: Dimensions::zero(),
            src_offset: Dimensions::zero(),
            dst_buffer: Dimensions::zero(),
            dst_offset: Dimensions::zero(),
            collective: true,
        }
    }
}

impl ReadOptions {
    /// A read issued by this process alone.
    pub fn independent() -> Self {
        Self {
            collective: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_source(mut self, extent: Dimensions, offset: Dimensions) -> Self {
        self.src_extent = extent;
        self.src_offset = offset;
        self
    }

    #[must_use]
    pub fn with_destination(mut self, buffer: Dimensions, offset: Dimensions) -> Self {
        self.dst_buffer = buffer;
        self.dst_offset = offset;
        self
    }
}

/// Result of a read or a size probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadInfo {
    /// Extent of the selection that was (or would be) read.
    pub size_read: Dimensions,
    /// Rank of the stored dataset.
    pub rank: u32,
    pub dtype: DataType,
}

/// One dataset or reference of an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Name relative to the iteration.
    pub name: String,
    pub dtype: DataType,
    pub rank: u32,
    /// Global shape, or the selected count for references to a region.
    pub shape: Dimensions,
    pub is_reference: bool,
}

/// Append cursor of a reserved dataset, local to this process.
#[derive(Debug, Clone, Copy)]
struct Reservation {
    offset: Dimensions,
    capacity: Dimensions,
    filled: u64,
}

struct Session {
    mode: AccessMode,
    compression: bool,
    cache: HandleCache,
    /// Keyed by in-file dataset path.
    reservations: HashMap<String, Reservation>,
}

/// Parallel checkpoint/restart collector for one process of a group.
pub struct ParallelDataCollector {
    comm: Box<dyn Communicator>,
    backend: Arc<dyn IoBackend>,
    config: CollectorConfig,
    topology: ProcessTopology,
    session: Option<Session>,
}

impl ParallelDataCollector {
    /// Creates a closed collector.
    ///
    /// # Arguments
    ///
    /// * `comm` - This process's handle on the process group
    /// * `backend` - Storage backend holding the iteration files
    /// * `config` - Collector configuration; its topology must hold exactly
    ///   `comm.size()` processes
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid or the
    /// process grid does not match the group size.
    pub fn new(
        comm: Box<dyn Communicator>,
        backend: Arc<dyn IoBackend>,
        config: CollectorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let topology =
            ProcessTopology::from_communicator(comm.as_ref(), config.collector.topology())?;
        debug!(
            rank = topology.rank,
            size = topology.size,
            grid = %topology.grid,
            position = %topology.position,
            "Created parallel data collector"
        );

        Ok(Self {
            comm,
            backend,
            config,
            topology,
            session: None,
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    /// Process grid shape.
    pub fn mpi_size(&self) -> Dimensions {
        self.topology.grid
    }

    /// Position of this process in the grid.
    pub fn mpi_position(&self) -> Dimensions {
        self.topology.position
    }

    pub fn state(&self) -> CollectorState {
        match self.session.as_ref().map(|s| s.mode) {
            None => CollectorState::Closed,
            Some(AccessMode::Create) => CollectorState::Creating,
            Some(AccessMode::Write) => CollectorState::Writing,
            Some(AccessMode::Read) => CollectorState::Reading,
        }
    }

    /// Opens a session on the iteration files named after `base`.
    ///
    /// Iteration `id` lives in `<base><id>.<ext>`. In create mode the set of
    /// known iterations starts empty; otherwise it is read from the files
    /// found next to `base`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the collector is already open, or a backend
    /// error if the directory cannot be scanned.
    pub fn open(&mut self, base: impl AsRef<Path>, attr: FileCreationAttr) -> Result<()> {
        if self.session.is_some() {
            return Err(CollectorError::invalid_state("collector is already open"));
        }

        let naming = FileNaming::new(base, &self.config.collector.file_extension);
        let index = match attr.mode {
            AccessMode::Create => IterationIndex::default(),
            AccessMode::Write | AccessMode::Read => {
                IterationIndex::new(naming.list_ids(self.backend.as_ref())?)
            }
        };
        let compression = attr
            .enable_compression
            .unwrap_or(self.config.collector.enable_compression);
        let header = FileHeader {
            topology: self.topology.grid,
            compression,
        };

        info!(
            dir = %naming.dir().display(),
            mode = ?attr.mode,
            known = index.ids().len(),
            compression,
            "Opened collector"
        );

        let cache = HandleCache::new(
            Arc::clone(&self.backend),
            naming,
            attr.mode,
            self.config.collector.max_file_handles as usize,
            header,
            index,
        );
        self.session = Some(Session {
            mode: attr.mode,
            compression,
            cache,
            reservations: HashMap::new(),
        });
        Ok(())
    }

    /// Closes the session. Collective. A closed collector is left as is.
    ///
    /// # Errors
    ///
    /// Returns the first error met while closing files; the collector is
    /// closed regardless.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let synced = self.comm.barrier();
        let closed = session.cache.close_all();
        info!(rank = self.topology.rank, "Closed collector");
        synced?;
        closed
    }

    /// Persists pending changes of all resident files.
    pub fn flush(&mut self) -> Result<()> {
        let (_, _, session) = self.session(false, "flush")?;
        session.cache.flush_all()
    }

    fn session(
        &mut self,
        writing: bool,
        op: &str,
    ) -> Result<(&dyn Communicator, &ProcessTopology, &mut Session)> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CollectorError::invalid_state(format!("{op} on a closed collector")))?;
        if writing && session.mode == AccessMode::Read {
            return Err(CollectorError::invalid_state(format!(
                "{op} on a collector opened for reading"
            )));
        }
        Ok((self.comm.as_ref(), &self.topology, session))
    }

    fn session_ref(&self, op: &str) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| CollectorError::invalid_state(format!("{op} on a closed collector")))
    }

    /// Highest known iteration id, or -1 if there is none.
    pub fn max_id(&self) -> Result<i32> {
        Ok(self.session_ref("max_id")?.cache.index().max_id())
    }

    /// Known iteration ids in ascending order.
    pub fn entry_ids(&self) -> Result<Vec<i32>> {
        Ok(self.session_ref("entry_ids")?.cache.index().ids())
    }

    /// Iterations with an open file handle, least recently used first.
    pub fn resident_ids(&self) -> Vec<i32> {
        self.session
            .as_ref()
            .map(|s| s.cache.resident_ids())
            .unwrap_or_default()
    }

    /// Lists datasets and references of iteration `id` without reading data.
    ///
    /// References whose target cannot be resolved are skipped.
    pub fn get_entries_for_id(&mut self, id: i32) -> Result<Vec<Entry>> {
        let (comm, _, session) = self.session(false, "get_entries_for_id")?;
        let group = iteration_group(id);
        let mut entries = Vec::new();
        let mut links = Vec::new();
        {
            let handle = session.cache.get_existing(comm, id, Participation::Independent)?;
            if handle.kind(&group)? != Some(ObjectKind::Group) {
                return Ok(entries);
            }
            collect_entries(handle, &group, "", &mut entries, &mut links)?;
        }

        for (name, target) in links {
            let resolved = session
                .cache
                .get_existing(comm, target.iteration, Participation::Independent)
                .and_then(|handle| handle.dataset_layout(&target.path));
            match resolved {
                Ok(layout) => entries.push(Entry {
                    name,
                    dtype: layout.dtype,
                    rank: layout.rank,
                    shape: target
                        .region
                        .map_or(layout.shape, |r| r.count.normalized(layout.rank, 1)),
                    is_reference: true,
                }),
                Err(e) => warn!(id, name = %name, error = %e, "Skipping unresolvable reference"),
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Writes typed data. See [`ParallelDataCollector::write_raw`].
    pub fn write<T: Element>(
        &mut self,
        id: i32,
        name: &str,
        opts: &WriteOptions,
        data: &[T],
    ) -> Result<()> {
        self.write_raw(id, name, T::DATA_TYPE, opts, bytemuck::cast_slice(data))
    }

    /// Writes this process's part of dataset `name` of iteration `id`.
    /// Collective: the file is opened by every process together, and without
    /// explicit geometry the global shape and this process's offset are
    /// gathered from all processes. Local argument errors are shared through
    /// the gather, so every process fails alike. The
    /// first write to a name defines its rank, type and shape; later writes
    /// must match.
    ///
    /// # Arguments
    ///
    /// * `id` - Iteration id
    /// * `name` - Dataset name inside the iteration, `/` separates groups
    /// * `dtype` - Element type of `data`
    /// * `opts` - Rank, buffer selection and optional explicit geometry
    /// * `data` - Local buffer, holding at least `opts.layout.buffer` elements
    ///
    /// # Errors
    ///
    /// `InvalidState` outside a writing session, `SchemaMismatch` on a schema
    /// conflict, `GeometryMismatch` on inconsistent geometry.
    pub fn write_raw(
        &mut self,
        id: i32,
        name: &str,
        dtype: DataType,
        opts: &WriteOptions,
        data: &[u8],
    ) -> Result<()> {
        let (comm, topology, session) = self.session(true, "write")?;
        let checked = check_write(id, name, dtype, opts, data.len());

        let (path, layout, geometry) = match opts.geometry {
            Some(geometry) => {
                let (path, layout) = checked?;
                (path, layout, geometry)
            }
            None => {
                let extent = checked.as_ref().ok().map(|(_, layout)| layout.extent);
                let geometry = gather(comm, topology, extent, opts.rank);
                let (path, layout) = checked?;
                (path, layout, geometry?)
            }
        };
        debug!(
            id,
            name,
            extent = %layout.extent,
            size = %geometry.size,
            offset = %geometry.offset,
            "Writing dataset"
        );

        let compression = session.compression;
        // Opening the file stays collective even when the geometry is given.
        let handle = session.cache.get(comm, id, Participation::Collective)?;
        engine::write_dataset(
            handle,
            &path,
            dtype,
            opts.rank,
            compression,
            geometry,
            &layout,
            data,
        )
    }

    /// Reads typed data into `dst`, or only reports the selection size when
    /// `dst` is `None`.
    ///
    /// # Errors
    ///
    /// `SchemaMismatch` if `T` differs from the stored element type, plus
    /// the errors of [`ParallelDataCollector::read_raw`].
    pub fn read<T: Element>(
        &mut self,
        id: i32,
        name: &str,
        opts: &ReadOptions,
        dst: Option<&mut [T]>,
    ) -> Result<ReadInfo> {
        let expected = dst.as_ref().map(|_| T::DATA_TYPE);
        let dst = dst.map(|values| bytemuck::cast_slice_mut::<T, u8>(values));
        self.read_with(id, name, opts, expected, dst)
    }

    /// Reads raw element bytes of dataset (or reference) `name`.
    ///
    /// A collective read ends with a barrier over the group.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing iteration or dataset, `GeometryMismatch` if
    /// the selection exceeds the dataset or the destination buffer.
    pub fn read_raw(
        &mut self,
        id: i32,
        name: &str,
        opts: &ReadOptions,
        dst: Option<&mut [u8]>,
    ) -> Result<ReadInfo> {
        self.read_with(id, name, opts, None, dst)
    }

    fn read_with(
        &mut self,
        id: i32,
        name: &str,
        opts: &ReadOptions,
        expected: Option<DataType>,
        dst: Option<&mut [u8]>,
    ) -> Result<ReadInfo> {
        self.session_ref("read")?;
        let result = self.read_local(id, name, opts, expected, dst);
        if !opts.collective {
            return result;
        }
        let synced = self.comm.barrier();
        let info = result?;
        synced?;
        Ok(info)
    }

    fn read_local(
        &mut self,
        id: i32,
        name: &str,
        opts: &ReadOptions,
        expected: Option<DataType>,
        dst: Option<&mut [u8]>,
    ) -> Result<ReadInfo> {
        let (comm, _, session) = self.session(false, "read")?;
        let path = data_path(id, name)?;
        let participation = if opts.collective {
            Participation::Collective
        } else {
            Participation::Independent
        };
        let (source_id, source_path, region) =
            locate(&mut session.cache, comm, id, path, participation)?;

        let handle = session.cache.get_existing(comm, source_id, participation)?;
        let layout = handle.dataset_layout(&source_path)?;
        let plan = engine::plan_read(layout, region.as_ref(), opts.src_extent, opts.src_offset)?;
        let info = ReadInfo {
            size_read: plan.src_extent,
            rank: layout.rank,
            dtype: layout.dtype,
        };

        let Some(dst) = dst else {
            return Ok(info);
        };
        if let Some(expected) = expected {
            if expected != layout.dtype {
                return Err(CollectorError::schema(
                    name,
                    format!("stored type {} read as {expected}", layout.dtype),
                ));
            }
        }
        if plan.src_extent.product() == 0 {
            return Ok(info);
        }

        let dst_offset = opts.dst_offset.normalized(layout.rank, 0);
        let dst_buffer = if opts.dst_buffer.is_zero() {
            dst_offset + plan.src_extent
        } else {
            opts.dst_buffer.normalized(layout.rank, 1)
        };
        let block = engine::read_block(handle, &source_path, &plan, region.as_ref())?;
        scatter(
            &block,
            layout.dtype.size(),
            plan.src_extent,
            dst,
            dst_buffer,
            dst_offset,
        )?;
        debug!(id, name, size = %plan.src_extent, "Read dataset");
        Ok(info)
    }

    /// Stored dimensionality of dataset (or reference) `name`.
    pub fn rank_of(&mut self, id: i32, name: &str) -> Result<u32> {
        let (comm, _, session) = self.session(false, "rank_of")?;
        let path = data_path(id, name)?;
        let (source_id, source_path, _) =
            locate(&mut session.cache, comm, id, path, Participation::Independent)?;
        let handle = session
            .cache
            .get_existing(comm, source_id, Participation::Independent)?;
        Ok(handle.dataset_layout(&source_path)?.rank)
    }

    /// Creates dataset `name` with gathered global geometry but no data and
    /// returns this process's placement in it. Collective.
    ///
    /// Subsequent [`ParallelDataCollector::append`] calls fill this
    /// process's region along axis 0.
    pub fn reserve(
        &mut self,
        id: i32,
        name: &str,
        size: Dimensions,
        rank: u32,
        dtype: DataType,
    ) -> Result<GlobalGeometry> {
        let (comm, topology, session) = self.session(true, "reserve")?;
        let extent = size.normalized(rank, 1);
        let checked = data_path(id, name).and_then(|path| {
            engine::check_rank(rank)?;
            Ok(path)
        });
        let geometry = gather(comm, topology, checked.as_ref().ok().map(|_| extent), rank);
        let path = checked?;
        let geometry = geometry?;
        let layout = DatasetLayout {
            dtype,
            rank,
            shape: geometry.size.normalized(rank, 1),
            compression: session.compression,
        };

        let handle = session.cache.get(comm, id, Participation::Collective)?;
        engine::ensure_dataset(handle, &path, layout, true)?;
        session.reservations.insert(
            path,
            Reservation {
                offset: geometry.offset,
                capacity: extent,
                filled: 0,
            },
        );
        debug!(id, name, size = %geometry.size, offset = %geometry.offset, "Reserved dataset");
        Ok(geometry)
    }

    /// Appends `extent` elements to this process's reserved region and
    /// returns the global offset they were written at.
    ///
    /// # Errors
    ///
    /// `NotFound` without a prior `reserve`, `GeometryMismatch` if the
    /// reserved capacity is exhausted.
    pub fn append<T: Element>(
        &mut self,
        id: i32,
        name: &str,
        extent: Dimensions,
        data: &[T],
    ) -> Result<Dimensions> {
        let (comm, _, session) = self.session(true, "append")?;
        let path = data_path(id, name)?;
        let reservation = session.reservations.get(&path).copied().ok_or_else(|| {
            CollectorError::not_found(format!("reservation of '{name}' in iteration {id}"))
        })?;

        let handle = session
            .cache
            .get_existing(comm, id, Participation::Independent)?;
        let layout = handle.dataset_layout(&path)?;
        let extent = extent.normalized(layout.rank, 1);
        let capacity = reservation.capacity;
        if reservation.filled + extent[0] > capacity[0]
            || extent[1] > capacity[1]
            || extent[2] > capacity[2]
        {
            return Err(CollectorError::geometry(format!(
                "append of {extent} to '{name}' exceeds reserved capacity {capacity} \
                 ({} already filled)",
                reservation.filled
            )));
        }

        let mut offset = reservation.offset;
        offset[0] += reservation.filled;
        write_into(handle, &path, name, layout, extent, offset, data)?;

        if let Some(r) = session.reservations.get_mut(&path) {
            r.filled += extent[0];
        }
        Ok(offset)
    }

    /// Writes `extent` elements at an explicit global offset of an existing
    /// dataset.
    pub fn append_at<T: Element>(
        &mut self,
        id: i32,
        name: &str,
        extent: Dimensions,
        offset: Dimensions,
        data: &[T],
    ) -> Result<()> {
        let (comm, _, session) = self.session(true, "append_at")?;
        let path = data_path(id, name)?;
        let handle = session
            .cache
            .get_existing(comm, id, Participation::Independent)?;
        if handle.kind(&path)? != Some(ObjectKind::Dataset) {
            return Err(CollectorError::not_found(format!(
                "dataset '{name}' in iteration {id}"
            )));
        }
        let layout = handle.dataset_layout(&path)?;
        let extent = extent.normalized(layout.rank, 1);
        write_into(
            handle,
            &path,
            name,
            layout,
            extent,
            offset.normalized(layout.rank, 0),
            data,
        )
    }

    /// Deletes iteration `id` with all its data. Collective.
    ///
    /// # Errors
    ///
    /// `NotFound` if the iteration does not exist.
    pub fn remove(&mut self, id: i32) -> Result<()> {
        let (comm, _, session) = self.session(true, "remove")?;
        if !session.cache.is_known(id)? {
            return Err(CollectorError::not_found(format!("iteration {id}")));
        }
        let path = session.cache.naming().path_for(id);
        let backend = Arc::clone(session.cache.backend());

        let closed = session.cache.close(id);
        let synced = comm.barrier();
        let removed = if comm.rank() == 0 && backend.exists(&path).unwrap_or(true) {
            backend.remove(&path)
        } else {
            Ok(())
        };
        let done = comm.barrier();

        session.cache.forget(id);
        let prefix = format!("{}/", iteration_group(id));
        session.reservations.retain(|key, _| !key.starts_with(&prefix));
        info!(id, path = %path.display(), "Removed iteration");

        closed?;
        synced?;
        removed?;
        done
    }

    /// Removes dataset (or reference) `name` from iteration `id`. Collective.
    pub fn remove_dataset(&mut self, id: i32, name: &str) -> Result<()> {
        let (comm, _, session) = self.session(true, "remove_dataset")?;
        let path = data_path(id, name)?;
        let handle = session
            .cache
            .get_existing(comm, id, Participation::Collective)?;
        if handle.kind(&path)?.is_none() {
            return Err(CollectorError::not_found(format!(
                "dataset '{name}' in iteration {id}"
            )));
        }

        comm.barrier()?;
        let removed = if comm.rank() == 0 {
            session
                .cache
                .get_existing(comm, id, Participation::Independent)
                .and_then(|handle| handle.unlink(&path))
        } else {
            Ok(())
        };
        let synced = comm.barrier();
        session.reservations.remove(&path);
        debug!(id, name, "Removed dataset");
        removed?;
        synced
    }

    /// Creates `dst_name` in iteration `dst_id` as a reference to dataset
    /// `src_name` of iteration `src_id`, optionally restricted to a strided
    /// region. No data is copied. Collective.
    ///
    /// # Errors
    ///
    /// `NotFound` if the source does not exist, `SchemaMismatch` if the
    /// destination name is taken, `GeometryMismatch` if the region does not
    /// fit the source.
    pub fn create_reference(
        &mut self,
        src_id: i32,
        src_name: &str,
        dst_id: i32,
        dst_name: &str,
        region: Option<Region>,
    ) -> Result<()> {
        let (comm, _, session) = self.session(true, "create_reference")?;
        let src_path = data_path(src_id, src_name)?;
        let dst_path = data_path(dst_id, dst_name)?;

        let layout = {
            let handle = session
                .cache
                .get_existing(comm, src_id, Participation::Collective)?;
            match handle.kind(&src_path)? {
                Some(ObjectKind::Dataset) => handle.dataset_layout(&src_path)?,
                Some(ObjectKind::Link) => {
                    return Err(CollectorError::schema(
                        src_name,
                        "a reference cannot point at another reference",
                    ))
                }
                _ => {
                    return Err(CollectorError::not_found(format!(
                        "dataset '{src_name}' in iteration {src_id}"
                    )))
                }
            }
        };

        let region = match region {
            Some(region) => Some(normalize_region(region, layout.rank, layout.shape)?),
            None => None,
        };

        let dst = session.cache.get(comm, dst_id, Participation::Collective)?;
        if dst.kind(&dst_path)?.is_some() {
            return Err(CollectorError::schema(dst_name, "destination already exists"));
        }

        comm.barrier()?;
        let created = if comm.rank() == 0 {
            session
                .cache
                .get_existing(comm, dst_id, Participation::Independent)
                .and_then(|handle| {
                    handle.create_link(
                        &dst_path,
                        LinkTarget {
                            iteration: src_id,
                            path: src_path,
                            region,
                        },
                    )
                })
        } else {
            Ok(())
        };
        let synced = comm.barrier();
        debug!(src_id, src_name, dst_id, dst_name, "Created reference");
        created?;
        synced
    }

    /// Writes attribute `name` on dataset `data_name` of iteration `id`, or
    /// on the iteration itself when `data_name` is `None`.
    ///
    /// Independent: any subset of processes may call it. The iteration must
    /// already exist, so an attribute write never creates a file.
    pub fn write_attribute(
        &mut self,
        id: i32,
        data_name: Option<&str>,
        name: &str,
        value: &Attribute,
    ) -> Result<()> {
        let (comm, _, session) = self.session(true, "write_attribute")?;
        let object = attribute_object(id, data_name)?;
        let handle = session
            .cache
            .get_existing(comm, id, Participation::Independent)?;
        if data_name.is_none() {
            handle.create_group(&object)?;
        } else if handle.kind(&object)?.is_none() {
            return Err(CollectorError::not_found(format!(
                "dataset '{object}' in iteration {id}"
            )));
        }
        handle.write_attribute(&object, name, value.clone())
    }

    /// Reads attribute `name` written by [`ParallelDataCollector::write_attribute`].
    pub fn read_attribute(
        &mut self,
        id: i32,
        data_name: Option<&str>,
        name: &str,
    ) -> Result<Attribute> {
        let (comm, _, session) = self.session(false, "read_attribute")?;
        let object = attribute_object(id, data_name)?;
        session
            .cache
            .get_existing(comm, id, Participation::Independent)?
            .read_attribute(&object, name)
    }

    /// Writes a file-scoped attribute of an existing iteration `id`.
    /// Independent.
    pub fn write_global_attribute(&mut self, id: i32, name: &str, value: &Attribute) -> Result<()> {
        let (comm, _, session) = self.session(true, "write_global_attribute")?;
        let handle = session
            .cache
            .get_existing(comm, id, Participation::Independent)?;
        handle.create_group(CUSTOM_GROUP)?;
        handle.write_attribute(CUSTOM_GROUP, name, value.clone())
    }

    pub fn read_global_attribute(&mut self, id: i32, name: &str) -> Result<Attribute> {
        let (comm, _, session) = self.session(false, "read_global_attribute")?;
        session
            .cache
            .get_existing(comm, id, Participation::Independent)?
            .read_attribute(CUSTOM_GROUP, name)
    }
}

impl Drop for ParallelDataCollector {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.cache.close_all() {
                warn!(error = %e, "Failed to close collector files on drop");
            }
        }
    }
}

/// Follows a reference at `path` to the iteration and path holding the data.
fn locate(
    cache: &mut HandleCache,
    comm: &dyn Communicator,
    id: i32,
    path: String,
    participation: Participation,
) -> Result<(i32, String, Option<Region>)> {
    let handle = cache.get_existing(comm, id, participation)?;
    Ok(match engine::resolve(handle, &path)? {
        Source::Dataset => (id, path, None),
        Source::Reference(target) => (target.iteration, target.path, target.region),
    })
}

/// Validates the process-local arguments of a write.
fn check_write(
    id: i32,
    name: &str,
    dtype: DataType,
    opts: &WriteOptions,
    len: usize,
) -> Result<(String, MemoryLayout)> {
    let path = data_path(id, name)?;
    engine::check_rank(opts.rank)?;
    let layout = opts.layout.resolve(opts.rank)?;
    check_buffer_len(len, layout.buffer, dtype.size())?;
    Ok((path, layout))
}

fn attribute_object(id: i32, data_name: Option<&str>) -> Result<String> {
    match data_name {
        Some(data_name) => data_path(id, data_name),
        None => Ok(iteration_group(id)),
    }
}

/// Fills region defaults for a source of `rank` and checks it fits `shape`.
fn normalize_region(region: Region, rank: u32, shape: Dimensions) -> Result<Region> {
    let mut stride = region.stride;
    for axis in 0..3 {
        stride[axis] = stride[axis].max(1);
    }
    let region = Region {
        count: region.count.normalized(rank, 1),
        offset: region.offset.normalized(rank, 0),
        stride: stride.normalized(rank, 1),
    };
    if !region.fits_in(shape) {
        return Err(CollectorError::geometry(format!(
            "region of {} elements at {} with stride {} exceeds source shape {shape}",
            region.count, region.offset, region.stride
        )));
    }
    Ok(region)
}

/// Writes a contiguous typed block into an existing dataset.
fn write_into<T: Element>(
    handle: &mut dyn FileHandle,
    path: &str,
    name: &str,
    layout: DatasetLayout,
    extent: Dimensions,
    offset: Dimensions,
    data: &[T],
) -> Result<()> {
    if T::DATA_TYPE != layout.dtype {
        return Err(CollectorError::schema(
            name,
            format!("stored type {} written as {}", layout.dtype, T::DATA_TYPE),
        ));
    }
    let memory = MemoryLayout::contiguous(extent).resolve(layout.rank)?;
    engine::write_dataset(
        handle,
        path,
        layout.dtype,
        layout.rank,
        layout.compression,
        GlobalGeometry::new(layout.shape, offset),
        &memory,
        bytemuck::cast_slice(data),
    )
}

fn collect_entries(
    handle: &dyn FileHandle,
    group: &str,
    prefix: &str,
    entries: &mut Vec<Entry>,
    links: &mut Vec<(String, LinkTarget)>,
) -> Result<()> {
    for child in handle.children(group)? {
        let path = format!("{group}/{child}");
        let name = if prefix.is_empty() {
            child
        } else {
            format!("{prefix}/{child}")
        };
        match handle.kind(&path)? {
            Some(ObjectKind::Group) => collect_entries(handle, &path, &name, entries, links)?,
            Some(ObjectKind::Dataset) => {
                let layout = handle.dataset_layout(&path)?;
                entries.push(Entry {
                    name,
                    dtype: layout.dtype,
                    rank: layout.rank,
                    shape: layout.shape,
                    is_reference: false,
                });
            }
            Some(ObjectKind::Link) => links.push((name, handle.link_target(&path)?)),
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::comm::SoloCommunicator;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn d(x: u64, y: u64, z: u64) -> Dimensions {
        Dimensions::new(x, y, z)
    }

    fn collector() -> ParallelDataCollector {
        ParallelDataCollector::new(
            Box::new(SoloCommunicator),
            Arc::new(LocalBackend::default()),
            CollectorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_state_machine() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("s_");
        let mut pdc = collector();
        assert_eq!(pdc.state(), CollectorState::Closed);

        let err = pdc.write(0, "x", &WriteOptions::new(1, d(1, 0, 0)), &[1u8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(pdc.max_id().unwrap_err().kind(), ErrorKind::InvalidState);

        pdc.open(&base, FileCreationAttr::create()).unwrap();
        assert_eq!(pdc.state(), CollectorState::Creating);
        let err = pdc.open(&base, FileCreationAttr::read()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        pdc.write(0, "x", &WriteOptions::new(1, d(1, 0, 0)), &[1u8]).unwrap();
        pdc.close().unwrap();
        assert_eq!(pdc.state(), CollectorState::Closed);

        pdc.open(&base, FileCreationAttr::read()).unwrap();
        assert_eq!(pdc.state(), CollectorState::Reading);
        let err = pdc.write(0, "y", &WriteOptions::new(1, d(1, 0, 0)), &[1u8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(pdc.remove(0).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(pdc.entry_ids().unwrap(), vec![0]);
        pdc.close().unwrap();
        // Closing twice is harmless
        pdc.close().unwrap();
    }

    #[test]
    fn test_size_query_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut pdc = collector();
        pdc.open(temp_dir.path().join("p_"), FileCreationAttr::create()).unwrap();
        let values: Vec<i16> = (0..12).collect();
        pdc.write(3, "grid/v", &WriteOptions::new(2, d(4, 3, 1)), &values).unwrap();

        let info = pdc.read::<i16>(3, "grid/v", &ReadOptions::default(), None).unwrap();
        assert_eq!(info.size_read, d(4, 3, 1));
        assert_eq!(info.rank, 2);
        assert_eq!(pdc.rank_of(3, "grid/v").unwrap(), 2);

        let mut back = vec![0i16; info.size_read.product() as usize];
        pdc.read(3, "grid/v", &ReadOptions::default(), Some(&mut back[..])).unwrap();
        assert_eq!(back, values);

        let mut wrong = vec![0f32; 12];
        let err = pdc
            .read(3, "grid/v", &ReadOptions::default(), Some(&mut wrong[..]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_read_sub_selection_into_offset() {
        let temp_dir = TempDir::new().unwrap();
        let mut pdc = collector();
        pdc.open(temp_dir.path().join("q_"), FileCreationAttr::create()).unwrap();
        let values: Vec<u32> = (0..16).collect();
        pdc.write(0, "m", &WriteOptions::new(2, d(4, 4, 1)), &values).unwrap();

        let opts = ReadOptions::default()
            .with_source(d(2, 2, 0), d(1, 2, 0))
            .with_destination(d(3, 3, 1), d(1, 1, 0));
        let mut dst = vec![0u32; 9];
        let info = pdc.read(0, "m", &opts, Some(&mut dst[..])).unwrap();
        assert_eq!(info.size_read, d(2, 2, 1));
        assert_eq!(dst, vec![0, 0, 0, 0, 9, 10, 0, 13, 14]);
    }

    #[test]
    fn test_missing_things_are_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let mut pdc = collector();
        pdc.open(temp_dir.path().join("n_"), FileCreationAttr::create()).unwrap();
        pdc.write(0, "a", &WriteOptions::new(1, d(2, 0, 0)), &[1u64, 2]).unwrap();

        let kind = |r: Result<ReadInfo>| r.unwrap_err().kind();
        assert_eq!(
            kind(pdc.read::<u64>(0, "b", &ReadOptions::default(), None)),
            ErrorKind::NotFound
        );
        assert_eq!(
            kind(pdc.read::<u64>(5, "a", &ReadOptions::default(), None)),
            ErrorKind::NotFound
        );
        assert_eq!(pdc.remove(9).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(pdc.remove_dataset(0, "b").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            pdc.read_attribute(0, Some("a"), "unit").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        // Reading never creates a file
        assert_eq!(pdc.entry_ids().unwrap(), vec![0]);
    }

    #[test]
    fn test_compression_override() {
        let temp_dir = TempDir::new().unwrap();
        let mut pdc = collector();
        pdc.open(
            temp_dir.path().join("c_"),
            FileCreationAttr::create().with_compression(true),
        )
        .unwrap();
        let values = vec![0.5f32; 1024];
        pdc.write(0, "z", &WriteOptions::new(1, d(1024, 0, 0)), &values).unwrap();
        let flag = pdc
            .read_global_attribute(0, "missing")
            .unwrap_err()
            .kind();
        assert_eq!(flag, ErrorKind::NotFound);
        pdc.close().unwrap();

        let raw = std::fs::metadata(temp_dir.path().join("c_0.h5")).unwrap().len();
        assert!(raw < 4096, "compressed file is {raw} bytes");

        pdc.open(temp_dir.path().join("c_"), FileCreationAttr::read()).unwrap();
        let mut back = vec![0f32; 1024];
        pdc.read(0, "z", &ReadOptions::independent(), Some(&mut back[..])).unwrap();
        assert_eq!(back, values);
    }
}
