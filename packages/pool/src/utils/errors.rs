// packages/pool/src/utils/errors.rs
//! Error types for the pool and the container runtime adapters
//!
//! Only argument errors, exhaustion and execution failures ever reach a
//! caller of the pool. Health-check and reset failures are resolved
//! internally and show up in the stats counters instead.

use std::time::Duration;
use thiserror::Error;

/// Maximum number of characters of a command kept in an [`PoolError::ExecutionFailure`]
pub const SNIPPET_CHARS: usize = 200;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors reported by a container runtime adapter
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("runtime command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("environment {0} not found")]
    NotFound(String),

    #[error("runtime executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime connection is closed")]
    Closed,
}

/// Errors surfaced by the pool and the executor
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no environment became available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("execution of `{snippet}` failed: {source}")]
    ExecutionFailure {
        snippet: String,
        #[source]
        source: RuntimeError,
    },

    #[error("source is {size} bytes, the limit is {limit} bytes")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("pool has been shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl PoolError {
    /// Wrap a runtime failure that happened while running `command`
    pub fn execution(command: &[String], source: RuntimeError) -> Self {
        PoolError::ExecutionFailure {
            snippet: truncate_chars(&command.join(" "), SNIPPET_CHARS),
            source,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::PoolExhausted { .. })
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Truncate `text` to at most `max_chars` characters
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
