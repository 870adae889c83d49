use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, control protocol, and HTTP adapter.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] mirror_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] mirror_sync::SyncError),

    #[error("remote error: {0}")]
    Remote(#[from] mirror_core::RemoteError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
