use std::io;
use std::path::PathBuf;

use oldschool_core::StoreError;
use thiserror::Error;

use super::paths::PathError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint at {key} holds a non-numeric value: {value:?}")]
    CorruptCheckpoint { key: String, value: String },
    #[error("checkpoint write to {key} failed: {source}")]
    CheckpointWrite {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("agent identity is already claimed at {key}")]
    IdentityInUse { key: String },
    #[error("identity lease at {key} expired or was taken over")]
    LeaseLost { key: String },
    #[error("store index {index} leaves no following index to watch from")]
    IndexExhausted { index: u64 },
    #[error("change feed ended unexpectedly")]
    FeedClosed,
}

impl SyncError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// The requested resume point fell out of the store's retention window.
    pub fn is_history_exhausted(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_history_exhausted())
    }
}
