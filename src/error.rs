//! Error types for the execution core.

use std::io;
use thiserror::Error;

/// Errors raised by the execution core.
///
/// A program that fails to compile, exits nonzero or times out is not an
/// error; that is reported inside [`crate::runner::ExecutionResult`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("File {name:?} exceeds the {limit} byte size limit")]
    TooLarge { name: String, limit: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl ExecError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ExecError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for faults of the service itself rather than of the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ExecError::Io { .. } | ExecError::Spawn { .. })
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
