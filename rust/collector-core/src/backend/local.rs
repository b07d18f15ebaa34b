// rust/collector-core/src/backend/local.rs

//! Local filesystem backend.
//!
//! Each collector file is one physical file holding an encoded
//! [`FileImage`]. Handles opened on the same path within one OS process
//! share a single in-memory image, the way several processes of a parallel
//! job share one file through collective I/O. The image is written back when
//! the last handle on it is closed, or on an explicit flush.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::Mmap;
use tracing::{debug, warn};

use super::format::{self, FileImage, NodeKind};
use super::traits::{DatasetLayout, FileHandle, IoBackend, LinkTarget, ObjectKind, OpenMode};
use crate::config::{CompressionConfig, StorageConfig};
use crate::datatype::Attribute;
use crate::dimensions::Dimensions;
use crate::error::{CollectorError, Result};

/// Image shared by all handles attached to one path.
#[derive(Debug)]
struct SharedImage {
    image: FileImage,
    dirty: bool,
}

#[derive(Debug)]
struct Attachment {
    /// Distinguishes re-attachments of the same path after a removal.
    token: u64,
    holders: usize,
    image: Arc<Mutex<SharedImage>>,
}

#[derive(Debug, Default)]
struct Registry {
    next_token: u64,
    attached: HashMap<PathBuf, Attachment>,
}

#[derive(Debug)]
struct Inner {
    storage: StorageConfig,
    compression: CompressionConfig,
    registry: Mutex<Registry>,
}

/// Local filesystem implementation of [`IoBackend`].
#[derive(Debug, Clone)]
pub struct LocalBackend {
    inner: Arc<Inner>,
}

impl LocalBackend {
    /// Creates a backend with the given I/O and codec settings.
    pub fn new(storage: StorageConfig, compression: CompressionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                compression,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(StorageConfig::default(), CompressionConfig::default())
    }
}

fn lock_image<'a>(
    image: &'a Mutex<SharedImage>,
    path: &Path,
) -> Result<MutexGuard<'a, SharedImage>> {
    image
        .lock()
        .map_err(|_| CollectorError::backend(path, "file image lock poisoned"))
}

impl Inner {
    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| CollectorError::backend("<registry>", "backend registry lock poisoned"))
    }

    /// Writes an encoded image to `path`, atomically if configured.
    fn persist(&self, path: &Path, image: &FileImage) -> Result<()> {
        let bytes = format::encode(image, &self.compression)
            .map_err(|e| CollectorError::backend_with_source(path, "failed to encode file", e))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    CollectorError::backend_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }

        if self.storage.atomic_writes {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
            self.write_file(&temp_path, &bytes)?;
            fs::rename(&temp_path, path).map_err(|e| {
                CollectorError::backend_with_source(
                    &temp_path,
                    format!("failed to rename to {}", path.display()),
                    e,
                )
            })
        } else {
            self.write_file(path, &bytes)
        }
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CollectorError::backend_with_source(path, "failed to create file", e))?;

        let mut writer = BufWriter::with_capacity(self.storage.buffer_size, file);
        writer
            .write_all(bytes)
            .map_err(|e| CollectorError::backend_with_source(path, "failed to write file", e))?;
        writer
            .flush()
            .map_err(|e| CollectorError::backend_with_source(path, "failed to flush file", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| CollectorError::backend_with_source(path, "failed to sync file", e))
    }

    /// Reads and decodes the image stored at `path`.
    fn load(&self, path: &Path) -> Result<FileImage> {
        let mut file = File::open(path)
            .map_err(|e| CollectorError::backend_with_source(path, "failed to open file", e))?;
        let size = file
            .metadata()
            .map_err(|e| {
                CollectorError::backend_with_source(path, "failed to read file metadata", e)
            })?
            .len();

        let decoded = if self.storage.use_mmap && size >= self.storage.mmap_threshold {
            // SAFETY: The file is opened read-only and the map is dropped
            // before this function returns.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                CollectorError::backend_with_source(path, "failed to memory-map file", e)
            })?;
            format::decode(&mmap)
        } else {
            let mut bytes = Vec::with_capacity(size as usize);
            file.read_to_end(&mut bytes)
                .map_err(|e| CollectorError::backend_with_source(path, "failed to read file", e))?;
            format::decode(&bytes)
        };

        decoded.map_err(|e| CollectorError::backend_with_source(path, "corrupted file", e))
    }

    fn attach(
        &self,
        registry: &mut Registry,
        path: &Path,
        image: FileImage,
        dirty: bool,
    ) -> (u64, Arc<Mutex<SharedImage>>) {
        registry.next_token += 1;
        let token = registry.next_token;
        let shared = Arc::new(Mutex::new(SharedImage { image, dirty }));
        registry.attached.insert(
            path.to_path_buf(),
            Attachment {
                token,
                holders: 1,
                image: Arc::clone(&shared),
            },
        );
        (token, shared)
    }

    /// Drops one holder of `path`; the last holder writes the image back.
    fn release(&self, path: &Path, token: u64) -> Result<()> {
        let mut registry = self.registry()?;
        let last = match registry.attached.get_mut(path) {
            Some(att) if att.token == token => {
                att.holders -= 1;
                att.holders == 0
            }
            // Removed while this handle was open.
            _ => return Ok(()),
        };
        if !last {
            return Ok(());
        }

        let Some(att) = registry.attached.remove(path) else {
            return Ok(());
        };
        let mut shared = lock_image(&att.image, path)?;
        if shared.dirty {
            self.persist(path, &shared.image)?;
            shared.dirty = false;
        }
        debug!(path = %path.display(), "Detached file");
        Ok(())
    }
}

impl IoBackend for LocalBackend {
    fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        let mut registry = self.inner.registry()?;

        if let Some(att) = registry.attached.get_mut(path) {
            att.holders += 1;
            let handle = LocalFileHandle::new(self, path, att.token, Arc::clone(&att.image), false);
            return Ok(Box::new(handle));
        }

        let image = FileImage::new();
        self.inner.persist(path, &image)?;
        let (token, shared) = self.inner.attach(&mut registry, path, image, false);
        debug!(path = %path.display(), "Created file");
        Ok(Box::new(LocalFileHandle::new(self, path, token, shared, false)))
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let read_only = mode == OpenMode::ReadOnly;
        let mut registry = self.inner.registry()?;

        if let Some(att) = registry.attached.get_mut(path) {
            att.holders += 1;
            let handle =
                LocalFileHandle::new(self, path, att.token, Arc::clone(&att.image), read_only);
            return Ok(Box::new(handle));
        }

        let image = self.inner.load(path)?;
        let (token, shared) = self.inner.attach(&mut registry, path, image, false);
        debug!(path = %path.display(), ?mode, "Opened file");
        Ok(Box::new(LocalFileHandle::new(self, path, token, shared, read_only)))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let registry = self.inner.registry()?;
        Ok(registry.attached.contains_key(path) || path.is_file())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut registry = self.inner.registry()?;
        let was_attached = registry.attached.remove(path).is_some();

        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if was_attached && e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CollectorError::backend_with_source(
                path,
                "failed to delete file",
                e,
            )),
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(CollectorError::backend(dir, "path is not a directory"));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)
            .map_err(|e| CollectorError::backend_with_source(dir, "failed to read directory", e))?
        {
            let entry = entry.map_err(|e| {
                CollectorError::backend_with_source(dir, "failed to read directory entry", e)
            })?;
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }
}

/// Handle on one attached file image.
pub struct LocalFileHandle {
    backend: Arc<Inner>,
    path: PathBuf,
    token: u64,
    image: Arc<Mutex<SharedImage>>,
    read_only: bool,
    released: bool,
}

impl LocalFileHandle {
    fn new(
        backend: &LocalBackend,
        path: &Path,
        token: u64,
        image: Arc<Mutex<SharedImage>>,
        read_only: bool,
    ) -> Self {
        Self {
            backend: Arc::clone(&backend.inner),
            path: path.to_path_buf(),
            token,
            image,
            read_only,
            released: false,
        }
    }

    fn shared(&self) -> Result<MutexGuard<'_, SharedImage>> {
        lock_image(&self.image, &self.path)
    }

    /// Locks the image for modification.
    fn writable(&self) -> Result<MutexGuard<'_, SharedImage>> {
        if self.read_only {
            return Err(CollectorError::backend(
                &self.path,
                "file is opened read-only",
            ));
        }
        let mut shared = self.shared()?;
        shared.dirty = true;
        Ok(shared)
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.backend.release(&self.path, self.token)
    }
}

fn missing(path: &str) -> CollectorError {
    CollectorError::not_found(format!("object '{path}'"))
}

impl FileHandle for LocalFileHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn create_group(&mut self, path: &str) -> Result<()> {
        self.writable()?.image.ensure_group(path)
    }

    fn kind(&self, path: &str) -> Result<Option<ObjectKind>> {
        Ok(self.shared()?.image.get(path).map(|node| node.object_kind()))
    }

    fn children(&self, group: &str) -> Result<Vec<String>> {
        let shared = self.shared()?;
        match shared.image.get(group).map(|node| &node.kind) {
            Some(NodeKind::Group) => Ok(shared.image.children(group)),
            Some(_) => Err(CollectorError::schema(group, "not a group")),
            None => Err(missing(group)),
        }
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        if self.writable()?.image.remove_subtree(path) {
            Ok(())
        } else {
            Err(missing(path))
        }
    }

    fn create_dataset(&mut self, path: &str, layout: DatasetLayout) -> Result<()> {
        self.writable()?.image.insert_dataset(path, layout)
    }

    fn dataset_layout(&self, path: &str) -> Result<DatasetLayout> {
        self.shared()?
            .image
            .dataset(path)
            .map(|ds| ds.layout)
            .ok_or_else(|| missing(path))
    }

    fn write_block(
        &mut self,
        path: &str,
        offset: Dimensions,
        extent: Dimensions,
        data: &[u8],
    ) -> Result<()> {
        let mut shared = self.writable()?;
        let dataset = shared.image.dataset_mut(path).ok_or_else(|| missing(path))?;
        dataset.write_block(offset, extent, data)
    }

    fn read_block(&self, path: &str, offset: Dimensions, extent: Dimensions) -> Result<Vec<u8>> {
        let shared = self.shared()?;
        let dataset = shared.image.dataset(path).ok_or_else(|| missing(path))?;
        dataset.read_block(offset, extent)
    }

    fn create_link(&mut self, path: &str, target: LinkTarget) -> Result<()> {
        self.writable()?.image.insert_link(path, target)
    }

    fn link_target(&self, path: &str) -> Result<LinkTarget> {
        match self.shared()?.image.get(path).map(|node| &node.kind) {
            Some(NodeKind::Link(target)) => Ok(target.clone()),
            _ => Err(missing(path)),
        }
    }

    fn write_attribute(&mut self, object: &str, name: &str, value: Attribute) -> Result<()> {
        let mut shared = self.writable()?;
        let node = shared.image.get_mut(object).ok_or_else(|| missing(object))?;
        node.attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn read_attribute(&self, object: &str, name: &str) -> Result<Attribute> {
        let shared = self.shared()?;
        let node = shared.image.get(object).ok_or_else(|| missing(object))?;
        node.attributes
            .get(name)
            .cloned()
            .ok_or_else(|| CollectorError::not_found(format!("attribute '{name}' on '{object}'")))
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut shared = self.shared()?;
        if shared.dirty {
            self.backend.persist(&self.path, &shared.image)?;
            shared.dirty = false;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release()
    }
}

impl Drop for LocalFileHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "Failed to release file on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionCodec;
    use crate::datatype::DataType;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn layout() -> DatasetLayout {
        DatasetLayout {
            dtype: DataType::Int32,
            rank: 1,
            shape: Dimensions::new(4, 1, 1),
            compression: false,
        }
    }

    #[test]
    fn test_create_write_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run0.h5");
        let backend = LocalBackend::default();

        let mut handle = backend.create(&path).unwrap();
        handle.create_dataset("/data/0/x", layout()).unwrap();
        let values: Vec<i32> = vec![1, 2, 3, 4];
        handle
            .write_block(
                "/data/0/x",
                Dimensions::zero(),
                Dimensions::new(4, 1, 1),
                bytemuck::cast_slice(&values),
            )
            .unwrap();
        handle
            .write_attribute("/data/0/x", "unit", Attribute::from_bool(true))
            .unwrap();
        handle.close().unwrap();

        assert!(backend.exists(&path).unwrap());

        let handle = backend.open(&path, OpenMode::ReadOnly).unwrap();
        assert!(handle.is_read_only());
        let bytes = handle
            .read_block("/data/0/x", Dimensions::new(1, 0, 0), Dimensions::new(2, 1, 1))
            .unwrap();
        let read: Vec<i32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(read, vec![2, 3]);
        assert!(handle.read_attribute("/data/0/x", "unit").unwrap().as_bool("unit").unwrap());
        assert_eq!(handle.kind("/data/0").unwrap(), Some(ObjectKind::Group));
        assert_eq!(handle.kind("/nothing").unwrap(), None);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ro.h5");
        let backend = LocalBackend::default();
        backend.create(&path).unwrap().close().unwrap();

        let mut handle = backend.open(&path, OpenMode::ReadOnly).unwrap();
        let err = handle.create_group("/g").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_shared_image_between_handles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared.h5");
        let backend = LocalBackend::default();

        let mut first = backend.create(&path).unwrap();
        first.create_group("/from_first").unwrap();

        // Joins the attached image instead of truncating it
        let mut second = backend.create(&path).unwrap();
        assert_eq!(second.kind("/from_first").unwrap(), Some(ObjectKind::Group));
        second.create_group("/from_second").unwrap();

        first.close().unwrap();
        second.close().unwrap();

        let reopened = backend.open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(
            reopened.children("/").unwrap(),
            vec!["from_first".to_string(), "from_second".to_string()]
        );
    }

    #[test]
    fn test_drop_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dropped.h5");
        let backend = LocalBackend::default();
        {
            let mut handle = backend.create(&path).unwrap();
            handle.create_group("/kept").unwrap();
        }
        let handle = backend.open(&path, OpenMode::ReadWrite).unwrap();
        assert_eq!(handle.kind("/kept").unwrap(), Some(ObjectKind::Group));
    }

    #[test]
    fn test_missing_file_open_fails() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::default();
        let err = backend
            .open(&temp_dir.path().join("absent.h5"), OpenMode::ReadOnly)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_corrupted_file_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("junk.h5");
        fs::write(&path, b"definitely not a collector file").unwrap();

        let err = LocalBackend::default()
            .open(&path, OpenMode::ReadOnly)
            .err()
            .unwrap();
        match err {
            CollectorError::Backend { file, .. } => assert_eq!(file, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_remove_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::default();
        for name in ["b.h5", "a.h5"] {
            backend.create(&temp_dir.path().join(name)).unwrap().close().unwrap();
        }
        assert_eq!(backend.list(temp_dir.path()).unwrap(), vec!["a.h5", "b.h5"]);

        backend.remove(&temp_dir.path().join("a.h5")).unwrap();
        assert_eq!(backend.list(temp_dir.path()).unwrap(), vec!["b.h5"]);
        assert!(backend.remove(&temp_dir.path().join("a.h5")).is_err());
        assert!(backend.list(&temp_dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_while_open_then_recreate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("r.h5");
        let backend = LocalBackend::default();

        let stale = backend.create(&path).unwrap();
        backend.remove(&path).unwrap();
        let mut fresh = backend.create(&path).unwrap();
        fresh.create_group("/fresh").unwrap();

        // Closing the stale handle must not detach the new file
        stale.close().unwrap();
        fresh.close().unwrap();

        let handle = backend.open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(handle.kind("/fresh").unwrap(), Some(ObjectKind::Group));
    }

    #[test]
    fn test_mmap_and_zstd_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.h5");
        let storage = StorageConfig {
            mmap_threshold: 0,
            atomic_writes: false,
            ..Default::default()
        };
        let compression = CompressionConfig {
            codec: CompressionCodec::Zstd,
            level: 3,
        };
        let backend = LocalBackend::new(storage, compression);

        let shape = Dimensions::new(128, 128, 1);
        let mut handle = backend.create(&path).unwrap();
        handle
            .create_dataset(
                "/big",
                DatasetLayout {
                    dtype: DataType::Float64,
                    rank: 2,
                    shape,
                    compression: true,
                },
            )
            .unwrap();
        let values: Vec<f64> = (0..shape.product()).map(|i| (i % 7) as f64).collect();
        handle
            .write_block("/big", Dimensions::zero(), shape, bytemuck::cast_slice(&values))
            .unwrap();
        handle.close().unwrap();

        // 128 KiB of raw payload shrinks on disk
        assert!(fs::metadata(&path).unwrap().len() < 64 * 1024);

        let handle = backend.open(&path, OpenMode::ReadOnly).unwrap();
        let bytes = handle.read_block("/big", Dimensions::zero(), shape).unwrap();
        let read: Vec<f64> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(read, values);
    }
}
