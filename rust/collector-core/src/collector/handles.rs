// rust/collector-core/src/collector/handles.rs

//! Bounded cache of open iteration files.
//!
//! Handles are kept in least-recently-used order. When the cache holds its
//! configured maximum and a new iteration is acquired, the least recently
//! used handle is closed. Eviction is process-local; because every process
//! issues the same sequence of collective calls, eviction order agrees across
//! the group without any coordination.
//!
//! Independent operations may be issued by a subset of processes, so they
//! never change the LRU state: a resident handle is used without touching its
//! recency, and a missing one is opened into a single private slot outside
//! the LRU, without a barrier.
//!
//! Callers borrow a handle mutably for the duration of one operation, so a
//! handle in use can never be evicted underneath it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use super::naming::{FileNaming, CUSTOM_GROUP, DATA_GROUP, HEADER_GROUP};
use crate::backend::{FileHandle, IoBackend, ObjectKind, OpenMode};
use crate::comm::Communicator;
use crate::datatype::Attribute;
use crate::dimensions::Dimensions;
use crate::error::{CollectorError, Result};

/// Major and minor version written to every file header.
pub const FORMAT_VERSION: [u32; 2] = [1, 0];

/// Access intent of a collector session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Start new iterations, truncating existing files on first touch.
    Create,
    /// Add to existing iterations, creating missing ones.
    Write,
    /// Read existing iterations only.
    Read,
}

/// Whether an operation is issued by the whole group or by any subset of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    /// Every process makes the same call in the same order.
    Collective,
    /// Any subset of processes may make the call.
    Independent,
}

/// File-level metadata written when a file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub topology: Dimensions,
    pub compression: bool,
}

/// What to do with a freshly acquired file handle.
#[derive(Debug, Clone, Copy)]
pub enum HandleInit {
    /// Write the file header for iteration `id`.
    Create { id: i32, header: FileHeader },
    /// Check that an existing file carries a compatible header.
    Open { id: i32 },
}

impl HandleInit {
    /// Applies the callback to `handle`.
    ///
    /// # Errors
    ///
    /// Returns a backend error naming the file if the header cannot be
    /// written or does not validate.
    pub fn apply(&self, handle: &mut dyn FileHandle) -> Result<()> {
        match *self {
            HandleInit::Create { id, header } => {
                for group in [HEADER_GROUP, DATA_GROUP, CUSTOM_GROUP] {
                    handle.create_group(group)?;
                }
                handle.write_attribute(
                    HEADER_GROUP,
                    "format_version",
                    Attribute::from_values(&FORMAT_VERSION)?,
                )?;
                handle.write_attribute(HEADER_GROUP, "iteration", Attribute::from_values(&[id])?)?;
                handle.write_attribute(
                    HEADER_GROUP,
                    "mpi_topology",
                    Attribute::from_values(&[header.topology])?,
                )?;
                handle.write_attribute(
                    HEADER_GROUP,
                    "compression",
                    Attribute::from_bool(header.compression),
                )
            }
            HandleInit::Open { id } => {
                let path = handle.path().to_path_buf();
                let incompatible = |detail: String| {
                    CollectorError::backend(
                        &path,
                        format!("incompatible file format for iteration {id}: {detail}"),
                    )
                };
                if handle.kind(HEADER_GROUP)? != Some(ObjectKind::Group) {
                    return Err(incompatible("missing header".to_string()));
                }
                let version: Vec<u32> = handle
                    .read_attribute(HEADER_GROUP, "format_version")
                    .and_then(|attr| attr.values("format_version"))
                    .map_err(|e| incompatible(e.to_string()))?;
                match version.first() {
                    Some(&major) if major == FORMAT_VERSION[0] => Ok(()),
                    _ => Err(incompatible(format!(
                        "version {version:?}, expected major {}",
                        FORMAT_VERSION[0]
                    ))),
                }
            }
        }
    }
}

/// Known iteration ids and their maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationIndex {
    ids: BTreeSet<i32>,
    max_id: i32,
}

impl Default for IterationIndex {
    fn default() -> Self {
        Self::new(BTreeSet::new())
    }
}

impl IterationIndex {
    /// Sentinel returned by [`IterationIndex::max_id`] when no id is known.
    pub const NO_ID: i32 = -1;

    pub fn new(ids: BTreeSet<i32>) -> Self {
        let max_id = ids.iter().next_back().copied().unwrap_or(Self::NO_ID);
        Self { ids, max_id }
    }

    pub fn insert(&mut self, id: i32) {
        if self.ids.insert(id) && (self.ids.len() == 1 || id > self.max_id) {
            self.max_id = id;
        }
    }

    pub fn remove(&mut self, id: i32) {
        if self.ids.remove(&id) && id == self.max_id {
            // Rescan the remaining ids.
            self.max_id = self.ids.iter().next_back().copied().unwrap_or(Self::NO_ID);
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.ids.contains(&id)
    }

    pub fn max_id(&self) -> i32 {
        self.max_id
    }

    /// Known ids in ascending order.
    pub fn ids(&self) -> Vec<i32> {
        self.ids.iter().copied().collect()
    }
}

/// LRU cache of open iteration files for one session.
pub struct HandleCache {
    backend: Arc<dyn IoBackend>,
    naming: FileNaming,
    mode: AccessMode,
    /// Maximum resident handles, 0 for unbounded.
    max_handles: usize,
    header: FileHeader,
    handles: HashMap<i32, Box<dyn FileHandle>>,
    /// Handle opened by an independent operation, kept out of the LRU.
    private: Option<(i32, Box<dyn FileHandle>)>,
    /// Least recently used at the front.
    recency: VecDeque<i32>,
    /// Iterations created during this session.
    created: HashSet<i32>,
    index: IterationIndex,
}

impl HandleCache {
    pub fn new(
        backend: Arc<dyn IoBackend>,
        naming: FileNaming,
        mode: AccessMode,
        max_handles: usize,
        header: FileHeader,
        index: IterationIndex,
    ) -> Self {
        Self {
            backend,
            naming,
            mode,
            max_handles,
            header,
            handles: HashMap::new(),
            private: None,
            recency: VecDeque::new(),
            created: HashSet::new(),
            index,
        }
    }

    pub fn naming(&self) -> &FileNaming {
        &self.naming
    }

    pub fn index(&self) -> &IterationIndex {
        &self.index
    }

    pub fn backend(&self) -> &Arc<dyn IoBackend> {
        &self.backend
    }

    /// Resident ids, least recently used first.
    pub fn resident_ids(&self) -> Vec<i32> {
        self.recency.iter().copied().collect()
    }

    /// Returns the handle for iteration `id`, opening or creating the file
    /// if it is not resident.
    ///
    /// Acquiring a new handle collectively in a writing mode ends with a
    /// barrier: every process of the group must request the same id in the
    /// same order. Independent requests never synchronize and leave the LRU
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing iteration in read mode, or a backend
    /// error carrying the file name if opening fails. Resident handles are
    /// left unchanged on failure.
    pub fn get(
        &mut self,
        comm: &dyn Communicator,
        id: i32,
        participation: Participation,
    ) -> Result<&mut dyn FileHandle> {
        if self.handles.contains_key(&id) {
            if participation == Participation::Collective {
                self.touch(id);
            }
        } else if participation == Participation::Independent {
            return self.get_private(comm, id);
        } else {
            // A failure here must not skip the barrier in `acquire`.
            if self.private_id() == Some(id) {
                if let Err(e) = self.close_private() {
                    warn!(id, error = %e, "Failed to close privately opened iteration file");
                }
            }
            let (handle, created) = self.acquire(comm, id, participation)?;
            if self.max_handles > 0 && self.handles.len() >= self.max_handles {
                self.evict_lru()?;
            }
            self.handles.insert(id, handle);
            self.recency.push_back(id);
            if created {
                self.created.insert(id);
            }
            self.index.insert(id);
        }

        match self.handles.get_mut(&id) {
            Some(handle) => Ok(handle.as_mut()),
            None => Err(vanished(id)),
        }
    }

    fn private_id(&self) -> Option<i32> {
        self.private.as_ref().map(|(id, _)| *id)
    }

    fn get_private(&mut self, comm: &dyn Communicator, id: i32) -> Result<&mut dyn FileHandle> {
        if self.private_id() != Some(id) {
            self.close_private()?;
            let (handle, created) = self.acquire(comm, id, Participation::Independent)?;
            debug!(id, "Opened iteration file outside the handle cache");
            if created {
                self.created.insert(id);
            }
            self.index.insert(id);
            self.private = Some((id, handle));
        }
        match self.private.as_mut() {
            Some((_, handle)) => Ok(handle.as_mut()),
            None => Err(vanished(id)),
        }
    }

    fn close_private(&mut self) -> Result<()> {
        match self.private.take() {
            Some((_, handle)) => handle.close(),
            None => Ok(()),
        }
    }

    /// Returns true if iteration `id` exists for this session.
    ///
    /// In create mode only iterations created during the session count.
    pub fn is_known(&self, id: i32) -> Result<bool> {
        if self.handles.contains_key(&id) || self.private_id() == Some(id) {
            return Ok(true);
        }
        match self.mode {
            AccessMode::Create => Ok(self.created.contains(&id)),
            _ => Ok(self.index.contains(id) || self.backend.exists(&self.naming.path_for(id))?),
        }
    }

    /// Like [`HandleCache::get`], but never creates a file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the iteration does not exist.
    pub fn get_existing(
        &mut self,
        comm: &dyn Communicator,
        id: i32,
        participation: Participation,
    ) -> Result<&mut dyn FileHandle> {
        if !self.is_known(id)? {
            return Err(CollectorError::not_found(format!("iteration {id}")));
        }
        self.get(comm, id, participation)
    }

    fn touch(&mut self, id: i32) {
        if let Some(pos) = self.recency.iter().position(|&r| r == id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(id);
    }

    /// Opens or creates the file of `id` and runs the matching callback.
    fn acquire(
        &self,
        comm: &dyn Communicator,
        id: i32,
        participation: Participation,
    ) -> Result<(Box<dyn FileHandle>, bool)> {
        let path = self.naming.path_for(id);

        if self.mode == AccessMode::Read {
            if !self.backend.exists(&path)? {
                return Err(CollectorError::not_found(format!(
                    "iteration {id} ({})",
                    path.display()
                )));
            }
            let mut handle = self.backend.open(&path, OpenMode::ReadOnly)?;
            HandleInit::Open { id }.apply(handle.as_mut())?;
            debug!(id, path = %path.display(), "Opened iteration file for reading");
            return Ok((handle, false));
        }

        let create = match self.mode {
            AccessMode::Create => !self.created.contains(&id),
            _ => !self.created.contains(&id) && !self.backend.exists(&path)?,
        };

        let acquired = if create {
            self.backend.create(&path).and_then(|mut handle| {
                HandleInit::Create {
                    id,
                    header: self.header,
                }
                .apply(handle.as_mut())?;
                Ok(handle)
            })
        } else {
            self.backend
                .open(&path, OpenMode::ReadWrite)
                .and_then(|mut handle| {
                    HandleInit::Open { id }.apply(handle.as_mut())?;
                    Ok(handle)
                })
        };

        // No process may run ahead and close the file before every process
        // has attached to it.
        let handle = if participation == Participation::Collective {
            let synced = comm.barrier();
            let handle = acquired?;
            synced?;
            handle
        } else {
            acquired?
        };

        debug!(id, path = %path.display(), create, "Acquired iteration file");
        Ok((handle, create))
    }

    fn evict_lru(&mut self) -> Result<()> {
        let Some(victim) = self.recency.pop_front() else {
            return Ok(());
        };
        debug!(id = victim, "Evicting least recently used file handle");
        match self.handles.remove(&victim) {
            Some(handle) => handle.close(),
            None => Ok(()),
        }
    }

    /// Closes the handle of `id` if resident.
    pub fn close(&mut self, id: i32) -> Result<()> {
        if self.private_id() == Some(id) {
            self.close_private()?;
        }
        self.recency.retain(|&r| r != id);
        match self.handles.remove(&id) {
            Some(handle) => handle.close(),
            None => Ok(()),
        }
    }

    /// Drops all knowledge of `id` after its file was deleted.
    pub fn forget(&mut self, id: i32) {
        self.created.remove(&id);
        self.index.remove(id);
    }

    /// Flushes every resident handle.
    pub fn flush_all(&mut self) -> Result<()> {
        for handle in self.handles.values_mut() {
            handle.flush()?;
        }
        if let Some((_, handle)) = self.private.as_mut() {
            handle.flush()?;
        }
        Ok(())
    }

    /// Closes every resident handle, reporting the first failure.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        if let Some((id, handle)) = self.private.take() {
            if let Err(e) = handle.close() {
                warn!(id, error = %e, "Failed to close iteration file");
                first_error = Some(e);
            }
        }
        for id in std::mem::take(&mut self.recency) {
            if let Some(handle) = self.handles.remove(&id) {
                if let Err(e) = handle.close() {
                    warn!(id, error = %e, "Failed to close iteration file");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.handles.clear();
        first_error.map_or(Ok(()), Err)
    }
}

fn vanished(id: i32) -> CollectorError {
    CollectorError::invalid_state(format!("handle for iteration {id} vanished from the cache"))
}
