//! Error types for the coverage runtime

use thiserror::Error;

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime errors: every variant is a syscall failure on the report file.
/// The C ABI wrappers collapse these to `-1`, leaving `errno` for the
/// caller.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{op} failed on the coverage report file: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Capture the current `errno` for a failed syscall.
    pub(crate) fn io(op: &'static str) -> Self {
        RuntimeError::Io {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// The OS error code, when one was recorded.
    pub fn errno(&self) -> Option<i32> {
        match self {
            RuntimeError::Io { source, .. } => source.raw_os_error(),
        }
    }
}
