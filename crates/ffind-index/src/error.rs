use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("path is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("cannot canonicalize path {path}: {reason}")]
    RootInvalid { path: PathBuf, reason: String },

    #[error("no valid root directories after deduplication")]
    NoRoots,

    #[error("inotify unavailable: {0}")]
    WatchInit(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
