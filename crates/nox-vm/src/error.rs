//! Error types for nox-vm.

use thiserror::Error;

/// Result type alias for nox-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while talking to the control plane or disk tools.
#[derive(Debug, Error)]
pub enum VmError {
    /// An external tool exited with a non-zero status
    #[error("`{program}` failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    /// The control plane has no definition for this instance
    #[error("instance not defined: {0}")]
    NotDefined(String),

    /// Instance is not in the expected state
    #[error("invalid instance state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Definition rejected before reaching the control plane
    #[error("configuration error: {0}")]
    Config(String),

    /// Tool output could not be understood
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for a control-plane call
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl VmError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only timeouts qualify; callers decide whether the call is idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(self, VmError::Timeout(_))
    }
}
