use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Core error type for tracer operations.
///
/// `Clone` so a poisoned job slot can hand the identical error to every
/// caller that was waiting on it, not just the first one to trigger the
/// computation. There is deliberately no cache-error variant here: cache
/// failures are swallowed and logged at the cache boundary and never reach
/// a job.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("IO error reading {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Parse error in {path}: {message}")]
    Parse {
        path: PathBuf,
        line: Option<u32>,
        column: Option<u32>,
        message: String,
    },

    #[error("Cannot resolve '{identifier}' from '{base_dir}': {message}")]
    Resolve {
        identifier: String,
        base_dir: PathBuf,
        message: String,
    },

    #[error("Unknown extension '{ext}' for {path}")]
    UnknownExtension { path: PathBuf, ext: String },

    #[error("{0}")]
    Other(Arc<str>),
}

impl Error {
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(Arc::from(msg.into()))
    }
}
