//! Adapter Error Types
//!
//! Errors raised by the host-facing collaborators. Every `AdapterError` is an
//! environment-level problem: the verifier reports it as inconclusive rather
//! than as a failed assertion.

use std::path::PathBuf;
use std::time::Duration;

/// Error types for host adapter operations
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Path does not exist
    #[error("No such resource: {0}")]
    NotFound(PathBuf),

    /// Caller lacks permission for the path
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// I/O failure against a host facility
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// External tool exited unsuccessfully
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Operation exceeded its time budget
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Operation cannot be performed on this host
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Tool output could not be interpreted
    #[error("Failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    /// VM has no running process
    #[error("VM {0} is not running")]
    VmNotRunning(String),
}

impl AdapterError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn parse(what: impl Into<String>, detail: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    /// Map an I/O error on a path to the matching variant
    pub fn from_path_io(path: &std::path::Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::io(format!("I/O error on {}", path.display()), source),
        }
    }
}

/// Errors from starting a VM
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The control plane refused to start the VM
    #[error("VM {vm} failed to start: {message}")]
    Rejected { vm: String, message: String },

    /// The control plane could not be reached
    #[error("VM control plane unavailable: {0}")]
    Unavailable(#[from] AdapterError),
}
