use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds of the network engine. The control service maps these onto
/// wire statuses; within the engine the variant decides whether an operation
/// is retried (transient upstream), surfaced as-is (validation, resource) or
/// ends the workflow (aborted, process fault).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {0} already exists")]
    NodeAlreadyExists(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("snapshot {0} already exists")]
    SnapshotAlreadyExists(String),

    #[error("upstream api error: {0}")]
    Upstream(String),

    #[error("timed out {0}")]
    Timeout(String),

    #[error("process fault: {0}")]
    Process(String),

    #[error("aborted")]
    Aborted,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }

    /// Transient errors are retried in-place by the workflow's polling
    /// loops; anything else aborts the enclosing workflow.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Upstream(_))
    }
}
