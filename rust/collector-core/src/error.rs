// rust/collector-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {

    #[error("Invalid state: {message}")]
    InvalidState {
        message: String,
    },

    #[error("Schema mismatch for '{name}': {message}")]
    SchemaMismatch {
        name: String,
        message: String,
    },

    #[error("Geometry mismatch: {message}")]
    GeometryMismatch {
        message: String,
    },

    #[error("Not found: {what}")]
    NotFound {
        what: String,
    },

    #[error("Backend error at '{file}': {message}")]
    Backend {
        file: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

/// Fieldless view of [`CollectorError`] for matching on the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    SchemaMismatch,
    GeometryMismatch,
    NotFound,
    Backend,
    Config,
    Serialization,
}

pub type Result<T> = std::result::Result<T, CollectorError>;

// Convenience constructors
impl CollectorError {

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn schema(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn geometry(message: impl Into<String>) -> Self {
        Self::GeometryMismatch {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn backend(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Backend {
            file: file.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with_source(
        file: impl Into<PathBuf>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            file: file.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::GeometryMismatch { .. } => ErrorKind::GeometryMismatch,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Config { .. } => ErrorKind::Config,
            Self::Serialization { .. } => ErrorKind::Serialization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            CollectorError::invalid_state("closed").kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            CollectorError::schema("field", "rank differs").kind(),
            ErrorKind::SchemaMismatch
        );
        assert_eq!(CollectorError::not_found("id 3").kind(), ErrorKind::NotFound);
        assert_eq!(
            CollectorError::backend("a.h5", "disk full").kind(),
            ErrorKind::Backend
        );
    }

    #[test]
    fn test_backend_message_names_file() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = CollectorError::backend_with_source("/tmp/run_3.h5", "failed to open file", io);
        let text = err.to_string();
        assert!(text.contains("/tmp/run_3.h5"));
        assert!(text.contains("failed to open file"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
