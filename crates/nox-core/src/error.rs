//! Error types for nox-core.

use thiserror::Error;

/// Result type alias for nox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during instance, image and backup operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Request rejected before any side effect
    #[error("invalid request: {0}")]
    Validation(String),

    /// An instance with this name already exists
    #[error("instance already exists: {0}")]
    NameConflict(String),

    /// Instance, image or backup not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Error from the control plane or disk tooling
    #[error("control plane error: {0}")]
    ControlPlane(#[from] nox_vm::VmError),

    /// No address appeared within the polling budget
    #[error("no address for {name} after {attempts} attempts")]
    NetworkTimeout {
        /// Instance name
        name: String,
        /// Polls performed
        attempts: u32,
    },

    /// Image cache or archive failure
    #[error("storage error: {message}")]
    Storage {
        /// What was being done
        message: String,
        /// Underlying transport or I/O error, when there is one
        #[source]
        source: Option<BoxError>,
    },

    /// Object store failure
    #[error("remote store error: {0}")]
    RemoteStore(#[from] object_store::Error),

    /// Invalid configuration value or file
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Storage error without an underlying cause.
    pub fn storage(message: impl Into<String>) -> Self {
        CoreError::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Storage error wrapping its cause.
    pub fn storage_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CoreError::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_storage_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = CoreError::storage_with("download failed", io);
        assert_eq!(err.to_string(), "storage error: download failed");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("reset"));
    }
}
