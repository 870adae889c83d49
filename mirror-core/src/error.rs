//! Error types for mirror-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EntityId, EntityKind, Side};

/// All errors that can arise while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A required credential or endpoint is not set.
    #[error("{server}: {what} not configured (set ${var} or add it to the config file)")]
    MissingSetting {
        server: Side,
        what: &'static str,
        var: String,
    },

    /// A value is present but unusable.
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Failures surfaced by a remote adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, or 5xx. Safe to retry.
    #[error("{server} unreachable: {message}")]
    Transient { server: Side, message: String },

    /// The server refused the request (bad payload, permissions).
    #[error("{server} rejected {kind} request: {message}")]
    Rejected {
        server: Side,
        kind: EntityKind,
        message: String,
    },

    /// A create collided with an entity that appeared concurrently.
    #[error("{server} reported a conflicting {kind} create: {message}")]
    Conflict {
        server: Side,
        kind: EntityKind,
        message: String,
    },

    #[error("{server} {kind} {id} not found")]
    NotFound {
        server: Side,
        kind: EntityKind,
        id: EntityId,
    },

    /// The response body could not be interpreted.
    #[error("{server} returned an undecodable response: {message}")]
    Decode { server: Side, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn server(&self) -> Side {
        match self {
            RemoteError::Transient { server, .. }
            | RemoteError::Rejected { server, .. }
            | RemoteError::Conflict { server, .. }
            | RemoteError::NotFound { server, .. }
            | RemoteError::Decode { server, .. } => *server,
        }
    }
}
