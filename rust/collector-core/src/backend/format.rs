// rust/collector-core/src/backend/format.rs

//! In-memory file image and its on-disk encoding.
//!
//! A collector file is stored as:
//! ```text
//! +----------------------+
//! | Magic "PDC1"         |  <- 4 bytes
//! +----------------------+
//! | Header length (u32)  |  <- little endian
//! +----------------------+
//! | Header (bincode)     |  <- ImageHeader
//! +----------------------+
//! | Body (bincode)       |  <- FileImage, compressed dataset payloads
//! +----------------------+
//! ```
//!
//! The header carries an XXHash64 checksum of the body so that truncated or
//! corrupted files are detected on open.

use std::collections::BTreeMap;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use super::traits::{DatasetLayout, LinkTarget, ObjectKind};
use crate::config::{CompressionCodec, CompressionConfig};
use crate::datatype::Attribute;
use crate::dimensions::{linear_index, Dimensions};
use crate::error::{CollectorError, Result};

/// Header preceding the encoded image body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Format version number
    pub version: u32,
    /// Codec used for compressed dataset payloads
    pub codec: CompressionCodec,
    /// XXHash64 checksum of the encoded body
    pub checksum: u64,
    /// Length of the encoded body in bytes
    pub body_len: u64,
}

impl ImageHeader {
    /// Magic bytes for collector files
    pub const MAGIC: [u8; 4] = *b"PDC1";

    /// Current format version
    pub const VERSION: u32 = 1;
}

/// Bulk data of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetNode {
    pub layout: DatasetLayout,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Group,
    Dataset(DatasetNode),
    Link(LinkTarget),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            attributes: BTreeMap::new(),
        }
    }

    pub fn object_kind(&self) -> ObjectKind {
        match self.kind {
            NodeKind::Group => ObjectKind::Group,
            NodeKind::Dataset(_) => ObjectKind::Dataset,
            NodeKind::Link(_) => ObjectKind::Link,
        }
    }
}

/// Normalizes an in-file path to `/a/b` form.
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Full namespace of one file, keyed by normalized absolute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileImage {
    nodes: BTreeMap<String, Node>,
}

impl Default for FileImage {
    fn default() -> Self {
        Self::new()
    }
}

impl FileImage {
    /// Creates an image holding only the root group.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(NodeKind::Group));
        Self { nodes }
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(&normalize(path))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(&normalize(path))
    }

    /// Creates `path` and missing ancestors as groups.
    pub fn ensure_group(&mut self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.nodes.get(&current) {
                Some(node) if node.object_kind() != ObjectKind::Group => {
                    return Err(CollectorError::schema(
                        current,
                        format!("is a {:?}, not a group", node.object_kind()),
                    ));
                }
                Some(_) => {}
                None => {
                    self.nodes.insert(current.clone(), Node::new(NodeKind::Group));
                }
            }
        }
        Ok(())
    }

    /// Inserts a new leaf node, creating parent groups as needed.
    fn insert_leaf(&mut self, path: &str, kind: NodeKind) -> Result<()> {
        let path = normalize(path);
        if self.nodes.contains_key(&path) {
            return Err(CollectorError::schema(path, "object already exists"));
        }
        if let Some(parent) = parent_of(&path) {
            self.ensure_group(parent)?;
        }
        self.nodes.insert(path, Node::new(kind));
        Ok(())
    }

    pub fn insert_dataset(&mut self, path: &str, layout: DatasetLayout) -> Result<()> {
        let len = layout.shape.product() as usize * layout.dtype.size();
        self.insert_leaf(
            path,
            NodeKind::Dataset(DatasetNode {
                layout,
                data: vec![0; len],
            }),
        )
    }

    pub fn insert_link(&mut self, path: &str, target: LinkTarget) -> Result<()> {
        self.insert_leaf(path, NodeKind::Link(target))
    }

    /// Removes `path` and its whole subtree. Returns false if it did not exist.
    pub fn remove_subtree(&mut self, path: &str) -> bool {
        let path = normalize(path);
        if path == "/" || !self.nodes.contains_key(&path) {
            return false;
        }
        let prefix = format!("{path}/");
        self.nodes
            .retain(|key, _| key != &path && !key.starts_with(&prefix));
        true
    }

    /// Immediate child names of `group`, sorted.
    pub fn children(&self, group: &str) -> Vec<String> {
        let group = normalize(group);
        let prefix = if group == "/" {
            "/".to_string()
        } else {
            format!("{group}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    pub fn dataset(&self, path: &str) -> Option<&DatasetNode> {
        match self.get(path).map(|n| &n.kind) {
            Some(NodeKind::Dataset(ds)) => Some(ds),
            _ => None,
        }
    }

    pub fn dataset_mut(&mut self, path: &str) -> Option<&mut DatasetNode> {
        match self.get_mut(path).map(|n| &mut n.kind) {
            Some(NodeKind::Dataset(ds)) => Some(ds),
            _ => None,
        }
    }

    fn datasets_mut(&mut self) -> impl Iterator<Item = &mut DatasetNode> {
        self.nodes.values_mut().filter_map(|node| match &mut node.kind {
            NodeKind::Dataset(ds) => Some(ds),
            _ => None,
        })
    }
}

impl DatasetNode {
    fn check_block(&self, offset: Dimensions, extent: Dimensions) -> Result<()> {
        if !extent.fits_at(offset, &self.layout.shape) {
            return Err(CollectorError::geometry(format!(
                "block at offset {offset} with extent {extent} exceeds dataset shape {}",
                self.layout.shape
            )));
        }
        Ok(())
    }

    /// Copies `data` (contiguous, `extent` elements) into the dataset at `offset`.
    pub fn write_block(
        &mut self,
        offset: Dimensions,
        extent: Dimensions,
        data: &[u8],
    ) -> Result<()> {
        self.check_block(offset, extent)?;
        let elem = self.layout.dtype.size();
        let expected = extent.product() as usize * elem;
        if data.len() != expected {
            return Err(CollectorError::geometry(format!(
                "block of extent {extent} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        let row = extent[0] as usize * elem;
        let shape = self.layout.shape;
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                let src = linear_index(Dimensions::new(0, y, z), extent) as usize * elem;
                let dst = linear_index(
                    Dimensions::new(offset[0], offset[1] + y, offset[2] + z),
                    shape,
                ) as usize
                    * elem;
                self.data[dst..dst + row].copy_from_slice(&data[src..src + row]);
            }
        }
        Ok(())
    }

    /// Reads a contiguous block of `extent` elements at `offset`.
    pub fn read_block(&self, offset: Dimensions, extent: Dimensions) -> Result<Vec<u8>> {
        self.check_block(offset, extent)?;
        let elem = self.layout.dtype.size();
        let mut out = vec![0u8; extent.product() as usize * elem];
        let row = extent[0] as usize * elem;
        let shape = self.layout.shape;
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                let dst = linear_index(Dimensions::new(0, y, z), extent) as usize * elem;
                let src = linear_index(
                    Dimensions::new(offset[0], offset[1] + y, offset[2] + z),
                    shape,
                ) as usize
                    * elem;
                out[dst..dst + row].copy_from_slice(&self.data[src..src + row]);
            }
        }
        Ok(out)
    }
}

/// Calculates XXHash64 checksum of data.
fn calculate_checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn compress(data: &[u8], config: &CompressionConfig) -> Result<Vec<u8>> {
    match config.codec {
        CompressionCodec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionCodec::Zstd => zstd::encode_all(data, config.level)
            .map_err(|e| CollectorError::serialization(format!("zstd compression failed: {e}"))),
    }
}

fn decompress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CollectorError::serialization(format!("lz4 decompression failed: {e}"))),
        CompressionCodec::Zstd => zstd::decode_all(data)
            .map_err(|e| CollectorError::serialization(format!("zstd decompression failed: {e}"))),
    }
}

/// Encodes an image into its on-disk byte form.
pub fn encode(image: &FileImage, compression: &CompressionConfig) -> Result<Vec<u8>> {
    let mut stored = image.clone();
    for dataset in stored.datasets_mut() {
        if dataset.layout.compression {
            dataset.data = compress(&dataset.data, compression)?;
        }
    }

    let body = bincode::serialize(&stored)
        .map_err(|e| CollectorError::serialization(format!("failed to serialize image: {e}")))?;

    let header = ImageHeader {
        version: ImageHeader::VERSION,
        codec: compression.codec,
        checksum: calculate_checksum(&body),
        body_len: body.len() as u64,
    };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| CollectorError::serialization(format!("failed to serialize header: {e}")))?;

    let mut out = Vec::with_capacity(8 + header_bytes.len() + body.len());
    out.extend_from_slice(&ImageHeader::MAGIC);
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes an image, verifying magic, version and checksum.
pub fn decode(bytes: &[u8]) -> Result<FileImage> {
    if bytes.len() < 8 {
        return Err(CollectorError::serialization("file too small to hold a header"));
    }
    if bytes[..4] != ImageHeader::MAGIC {
        return Err(CollectorError::serialization("invalid magic bytes"));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[4..8]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let body_start = 8 + header_len;
    if bytes.len() < body_start {
        return Err(CollectorError::serialization("truncated header"));
    }

    let header: ImageHeader = bincode::deserialize(&bytes[8..body_start])
        .map_err(|e| CollectorError::serialization(format!("failed to decode header: {e}")))?;
    if header.version != ImageHeader::VERSION {
        return Err(CollectorError::serialization(format!(
            "unsupported format version {}",
            header.version
        )));
    }

    let body = &bytes[body_start..];
    if body.len() as u64 != header.body_len {
        return Err(CollectorError::serialization(format!(
            "body length mismatch: expected {}, got {}",
            header.body_len,
            body.len()
        )));
    }
    if calculate_checksum(body) != header.checksum {
        return Err(CollectorError::serialization("checksum mismatch"));
    }

    let mut image: FileImage = bincode::deserialize(body)
        .map_err(|e| CollectorError::serialization(format!("failed to decode image: {e}")))?;
    for dataset in image.datasets_mut() {
        if dataset.layout.compression {
            dataset.data = decompress(&dataset.data, header.codec)?;
        }
    }
    Ok(image)
}
