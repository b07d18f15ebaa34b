// rust/collector-core/src/collector/naming.rs

//! File naming and in-file path conventions.
//!
//! Iteration `id` of a session opened with base `out/run_` lives in
//! `out/run_<id>.<ext>`. Inside each file, datasets of the iteration sit
//! below `/data/<id>`, file header attributes on `/header` and global
//! attributes on `/custom`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::backend::format::normalize;
use crate::backend::IoBackend;
use crate::error::{CollectorError, Result};

/// Group holding the file header attributes.
pub const HEADER_GROUP: &str = "/header";

/// Group holding user-defined global attributes.
pub const CUSTOM_GROUP: &str = "/custom";

/// Group holding the datasets of every iteration.
pub const DATA_GROUP: &str = "/data";

/// Maps iteration ids to file paths and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl FileNaming {
    /// Builds the naming scheme for `base`.
    ///
    /// A base ending in a path separator names a directory; files then carry
    /// no prefix.
    pub fn new(base: impl AsRef<Path>, extension: &str) -> Self {
        let base = base.as_ref();
        let text = base.to_string_lossy();
        let (dir, prefix) = if text.ends_with('/') || text.ends_with(std::path::MAIN_SEPARATOR) {
            (base.to_path_buf(), String::new())
        } else {
            let dir = base
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let prefix = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (dir, prefix)
        };

        Self {
            dir,
            prefix,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Directory holding the iteration files.
    pub fn dir(&self) -> &Path {
        if self.dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.dir
        }
    }

    /// Physical file of iteration `id`.
    pub fn path_for(&self, id: i32) -> PathBuf {
        self.dir
            .join(format!("{}{id}.{}", self.prefix, self.extension))
    }

    /// Parses the iteration id back out of a file name; `None` if the name
    /// does not follow the scheme.
    pub fn parse_id(&self, file_name: &str) -> Option<i32> {
        let stem = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        if stem.is_empty() || stem.starts_with('+') {
            return None;
        }
        stem.parse().ok()
    }

    /// Scans the directory for iteration files, skipping unrelated entries.
    pub fn list_ids(&self, backend: &dyn IoBackend) -> Result<BTreeSet<i32>> {
        Ok(backend
            .list(self.dir())?
            .iter()
            .filter_map(|name| self.parse_id(name))
            .collect())
    }
}

/// Group holding the datasets of iteration `id`.
pub fn iteration_group(id: i32) -> String {
    format!("{DATA_GROUP}/{id}")
}

/// Absolute in-file path of dataset `name` of iteration `id`.
///
/// # Errors
///
/// Returns a schema error if `name` is empty or contains `.`/`..` segments.
pub fn data_path(id: i32, name: &str) -> Result<String> {
    let name = normalize(name);
    if name == "/" {
        return Err(CollectorError::schema(name, "dataset name must not be empty"));
    }
    if name.split('/').any(|part| part == "." || part == "..") {
        return Err(CollectorError::schema(
            name,
            "dataset name must not contain relative segments",
        ));
    }
    Ok(format!("{}{name}", iteration_group(id)))
}
