//! Shared error type for the backend core (spec §7).
//!
//! One variant per wire-level-stable error kind. `kind()` returns the
//! stable string name so callers that cross a process boundary (e.g. the
//! MCP adapter) can serialise the failure without matching on the enum.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("path escapes workspace root: {0}")]
    PathEscape(String),

    #[error("empty command")]
    EmptyCommand,

    #[error("dangerous operation: {0}")]
    DangerousOperation(String),

    #[error("unsafe command: {reason}")]
    UnsafeCommand { reason: String },

    #[error("exec failed: code={code:?}, stderr={stderr}")]
    ExecFailed { code: Option<i32>, stderr: String },

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("readdir failed: {0}")]
    LsFailed(String),

    #[error("operation attempted on a destroyed backend")]
    ConnectionClosed,

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    /// The wire-stable kind name from spec §7.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::PathEscape(_) => "path-escape",
            BackendError::EmptyCommand => "empty-command",
            BackendError::DangerousOperation(_) => "dangerous-operation",
            BackendError::UnsafeCommand { .. } => "unsafe-command",
            BackendError::ExecFailed { .. } => "exec-failed",
            BackendError::ReadFailed(_) => "read-failed",
            BackendError::WriteFailed(_) => "write-failed",
            BackendError::LsFailed(_) => "ls-failed",
            BackendError::ConnectionClosed => "connection-closed",
            BackendError::Timeout(_) => "timeout",
            BackendError::Io(_) => "read-failed",
        }
    }
}
