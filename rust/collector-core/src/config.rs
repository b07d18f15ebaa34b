// rust/collector-core/src/config.rs

//! Configuration management for the parallel data collector.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::dimensions::Dimensions;
use crate::error::{CollectorError, Result};

// Top-level collector configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub collector: CollectorOptions,
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
}

/// Process grid and handle cache options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorOptions {
    /// Number of processes along each grid axis.
    pub topology: [u64; 3],
    /// Maximum number of concurrently open file handles (0 = unbounded).
    pub max_file_handles: u32,
    /// Whether datasets are created with compression enabled.
    pub enable_compression: bool,
    /// Extension of iteration files, without the leading dot.
    pub file_extension: String,
}

// Local backend I/O options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Buffer size in bytes for file reads and writes.
    pub buffer_size: usize,
    // Whether to memory-map large files when loading them.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
    // Whether to persist images atomically (write to temp then rename).
    pub atomic_writes: bool,
}

/// Compression codec for compressed datasets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    Lz4,
    Zstd,
}

impl FromStr for CompressionCodec {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(CollectorError::config(format!(
                "unknown compression codec '{other}' (expected lz4 or zstd)"
            ))),
        }
    }
}

// Codec options used by the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub codec: CompressionCodec,
    // Compression level (zstd only).
    pub level: i32,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            topology: [1, 1, 1],
            max_file_handles: 0,
            enable_compression: false,
            file_extension: "h5".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,    // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
            atomic_writes: true,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: CompressionCodec::Lz4,
            level: 1,
        }
    }
}

impl CollectorOptions {
    pub fn topology(&self) -> Dimensions {
        Dimensions(self.topology)
    }
}

/// Parses a grid such as `2x1x1` (missing trailing axes default to 1).
fn parse_topology(value: &str) -> Option<[u64; 3]> {
    let mut grid = [1u64; 3];
    let parts: Vec<&str> = value.split(['x', 'X', ',']).collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    for (axis, part) in parts.iter().enumerate() {
        grid[axis] = part.trim().parse().ok()?;
    }
    Some(grid)
}

impl FromStr for CollectorConfig {
    type Err = CollectorError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CollectorError::config_with_source("failed to parse TOML config", e))
    }
}

impl CollectorConfig {
    /// Creates a configuration for the given process grid with defaults elsewhere.
    pub fn with_topology(topology: Dimensions) -> Self {
        let mut config = Self::default();
        config.collector.topology = topology.as_array();
        config
    }

    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollectorError::backend_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `PDC_`. For example:
    // - `PDC_TOPOLOGY=2x2x1` overrides `collector.topology`
    // - `PDC_MAX_FILE_HANDLES` overrides `collector.max_file_handles`
    // - `PDC_COMPRESSION_CODEC` overrides `compression.codec`
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("PDC_TOPOLOGY") {
            if let Some(grid) = parse_topology(&val) {
                self.collector.topology = grid;
            }
        }
        if let Ok(val) = std::env::var("PDC_MAX_FILE_HANDLES") {
            if let Ok(v) = val.parse() {
                self.collector.max_file_handles = v;
            }
        }
        if let Ok(val) = std::env::var("PDC_ENABLE_COMPRESSION") {
            if let Ok(v) = val.parse() {
                self.collector.enable_compression = v;
            }
        }
        if let Ok(val) = std::env::var("PDC_FILE_EXTENSION") {
            self.collector.file_extension = val.trim_start_matches('.').to_string();
        }

        // Storage overrides
        if let Ok(val) = std::env::var("PDC_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("PDC_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("PDC_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("PDC_STORAGE_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.storage.atomic_writes = v;
            }
        }

        // Compression overrides
        if let Ok(val) = std::env::var("PDC_COMPRESSION_CODEC") {
            if let Ok(v) = val.parse() {
                self.compression.codec = v;
            }
        }
        if let Ok(val) = std::env::var("PDC_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.compression.level = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.collector.topology.iter().any(|&axis| axis == 0) {
            return Err(CollectorError::config(
                "collector.topology axes must be greater than 0",
            ));
        }
        if self.collector.file_extension.is_empty() {
            return Err(CollectorError::config(
                "collector.file_extension must not be empty",
            ));
        }
        if self.storage.buffer_size == 0 {
            return Err(CollectorError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }
        if self.compression.codec == CompressionCodec::Zstd
            && !(1..=22).contains(&self.compression.level)
        {
            return Err(CollectorError::config(
                "compression.level must be between 1 and 22 for zstd",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CollectorConfig::default();

        assert_eq!(config.collector.topology, [1, 1, 1]);
        assert_eq!(config.collector.max_file_handles, 0);
        assert!(!config.collector.enable_compression);
        assert_eq!(config.collector.file_extension, "h5");

        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert!(config.storage.atomic_writes);

        assert_eq!(config.compression.codec, CompressionCodec::Lz4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [collector]
            topology = [2, 2, 1]
            max_file_handles = 4
        "#;
        let config: CollectorConfig = toml.parse().unwrap();

        assert_eq!(config.collector.topology(), Dimensions::new(2, 2, 1));
        assert_eq!(config.collector.max_file_handles, 4);
        // Other fields keep their defaults
        assert!(!config.collector.enable_compression);
        assert_eq!(config.compression.codec, CompressionCodec::Lz4);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [collector]
            topology = [4, 1, 1]
            max_file_handles = 2
            enable_compression = true
            file_extension = "pdc"

            [storage]
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152
            atomic_writes = false

            [compression]
            codec = "zstd"
            level = 3
        "#;
        let config: CollectorConfig = toml.parse().unwrap();

        assert_eq!(config.collector.topology, [4, 1, 1]);
        assert!(config.collector.enable_compression);
        assert_eq!(config.collector.file_extension, "pdc");
        assert_eq!(config.storage.buffer_size, 131072);
        assert!(!config.storage.use_mmap);
        assert!(!config.storage.atomic_writes);
        assert_eq!(config.compression.codec, CompressionCodec::Zstd);
        assert_eq!(config.compression.level, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<CollectorConfig, _> = "topology = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [collector]
            topology = [2, 1, 1]
            "#
        )
        .unwrap();

        let config = CollectorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.collector.topology, [2, 1, 1]);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = CollectorConfig::from_file("/nonexistent/collector.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_zero_topology_axis() {
        let mut config = CollectorConfig::default();
        config.collector.topology = [2, 0, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zstd_level() {
        let mut config = CollectorConfig::default();
        config.compression.codec = CompressionCodec::Zstd;
        config.compression.level = 40;
        assert!(config.validate().is_err());
        config.compression.level = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_topology() {
        assert_eq!(parse_topology("2x3x4"), Some([2, 3, 4]));
        assert_eq!(parse_topology("8"), Some([8, 1, 1]));
        assert_eq!(parse_topology("2,2"), Some([2, 2, 1]));
        assert_eq!(parse_topology("2xfoo"), None);
        assert_eq!(parse_topology("1x1x1x1"), None);
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("LZ4".parse::<CompressionCodec>().unwrap(), CompressionCodec::Lz4);
        assert_eq!("zstd".parse::<CompressionCodec>().unwrap(), CompressionCodec::Zstd);
        assert!("gzip".parse::<CompressionCodec>().is_err());
    }

    // Helper to clear all PDC_ environment variables for test isolation
    fn clear_pdc_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("PDC_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests live in a single test because env vars are
    // process-global and tests run in parallel.
    #[test]
    fn test_env_overrides() {
        clear_pdc_env_vars();

        std::env::set_var("PDC_TOPOLOGY", "2x2x1");
        std::env::set_var("PDC_MAX_FILE_HANDLES", "3");
        std::env::set_var("PDC_ENABLE_COMPRESSION", "true");
        std::env::set_var("PDC_COMPRESSION_CODEC", "zstd");
        std::env::set_var("PDC_FILE_EXTENSION", ".pdc");

        let config = CollectorConfig::default().with_env_overrides();
        assert_eq!(config.collector.topology, [2, 2, 1]);
        assert_eq!(config.collector.max_file_handles, 3);
        assert!(config.collector.enable_compression);
        assert_eq!(config.compression.codec, CompressionCodec::Zstd);
        assert_eq!(config.collector.file_extension, "pdc");

        clear_pdc_env_vars();

        // Invalid values are ignored
        std::env::set_var("PDC_MAX_FILE_HANDLES", "many");
        std::env::set_var("PDC_TOPOLOGY", "axb");
        let config = CollectorConfig::default().with_env_overrides();
        assert_eq!(config.collector.max_file_handles, 0);
        assert_eq!(config.collector.topology, [1, 1, 1]);

        clear_pdc_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = CollectorConfig::with_topology(Dimensions::new(2, 1, 1));
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: CollectorConfig = toml_str.parse().unwrap();

        assert_eq!(original.collector.topology, parsed.collector.topology);
        assert_eq!(original.storage.buffer_size, parsed.storage.buffer_size);
        assert_eq!(original.compression.codec, parsed.compression.codec);
    }
}
