//! Error types for the harvester.
//!
//! Library crates use [`HarvesterError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all harvester operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvesterError {
    /// Settings loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Bad enqueue input or an illegal record mutation. The job is never created.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The job's output directory is unusable; remaining stages are aborted.
    #[error("fatal job error: {message}")]
    Fatal { message: String },

    /// Network/HTTP error while searching or downloading images.
    #[error("network error: {0}")]
    Network(String),

    /// External tool could not be spawned, timed out, or exited non-zero.
    #[error("tool error: {0}")]
    Tool(String),

    /// Malformed collaborator output (SRT, bridge message, HTML).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvesterError>;

impl HarvesterError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a fatal job error from any displayable message.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the whole job rather than a single stage.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}
