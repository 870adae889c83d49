//! Error types for mirror-sync.

use thiserror::Error;

use mirror_core::{EntityId, EntityKind, EntityRef, RemoteError, Side};

/// All errors that can arise while mirroring one event.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An adapter call failed. Transient variants are retried.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The destination has no project of the same name. Projects are never
    /// created by the engine.
    #[error("project '{project}' not found on {server}")]
    ProjectNotFound { server: Side, project: String },

    /// The entity a note hangs off (or a container on a task's path) does
    /// not exist on the destination.
    #[error("parent '{parent}' in project '{project}' not found on {server}")]
    ParentNotFound {
        server: Side,
        project: String,
        parent: String,
    },

    /// A create raced with another writer and the winner could not be re-read.
    #[error("{kind} '{key}' on {server} conflicted on create and could not be re-read")]
    ConcurrentCreateConflict {
        server: Side,
        kind: EntityKind,
        key: String,
    },

    /// The source entity lacks data required to mirror it.
    #[error("{kind} {id} on {server} is malformed: {reason}")]
    Malformed {
        server: Side,
        kind: EntityKind,
        id: EntityId,
        reason: String,
    },

    /// The entity an event refers to is not (yet) readable on its server.
    #[error("{kind} {id} not readable on {server}")]
    SourceMissing {
        server: Side,
        kind: EntityKind,
        id: EntityId,
    },

    /// One handler attempt exceeded its deadline.
    #[error("handling {entity} timed out after {elapsed_ms} ms")]
    Timeout { entity: EntityRef, elapsed_ms: u64 },
}

impl SyncError {
    /// Whether another attempt could succeed. Read-after-write lag makes a
    /// missing source entity worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_transient(),
            SyncError::Timeout { .. } | SyncError::SourceMissing { .. } => true,
            _ => false,
        }
    }

    /// Short machine-readable label for logs and counters.
    pub fn label(&self) -> &'static str {
        match self {
            SyncError::Remote(err) if err.is_transient() => "transient_network",
            SyncError::Remote(_) => "remote",
            SyncError::ProjectNotFound { .. } => "project_not_found",
            SyncError::ParentNotFound { .. } => "parent_not_found",
            SyncError::ConcurrentCreateConflict { .. } => "concurrent_create_conflict",
            SyncError::Malformed { .. } => "malformed",
            SyncError::SourceMissing { .. } => "source_missing",
            SyncError::Timeout { .. } => "timeout",
        }
    }
}
