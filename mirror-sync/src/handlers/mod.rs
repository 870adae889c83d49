//! One handler per mirrored entity type.
//!
//! Handlers are stateless; everything shared lives on [`SyncEngine`]. Each
//! handler checks echo suppression itself because the shot template handler
//! writes back to the side it observes and must not be suppressed by it.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use mirror_core::{EntityKind, EntityRef, Event};

use crate::engine::SyncEngine;
use crate::error::SyncError;

pub mod note;
pub mod shot;
pub mod task;
pub mod version;

pub use note::NoteHandler;
pub use shot::ShotTemplateHandler;
pub use task::TaskHandler;
pub use version::VersionHandler;

/// Which handler an event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Task,
    Note,
    Version,
    Shot,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] = [
        HandlerKind::Task,
        HandlerKind::Note,
        HandlerKind::Version,
        HandlerKind::Shot,
    ];

    /// Handler responsible for `add` events on entities of `kind`.
    pub fn for_entity(kind: EntityKind) -> Option<Self> {
        match kind {
            EntityKind::Task => Some(HandlerKind::Task),
            EntityKind::Note => Some(HandlerKind::Note),
            EntityKind::Version => Some(HandlerKind::Version),
            EntityKind::Shot => Some(HandlerKind::Shot),
            _ => None,
        }
    }

    pub fn entity_kind(self) -> EntityKind {
        match self {
            HandlerKind::Task => EntityKind::Task,
            HandlerKind::Note => EntityKind::Note,
            HandlerKind::Version => EntityKind::Version,
            HandlerKind::Shot => EntityKind::Shot,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::Task => "task",
            HandlerKind::Note => "note",
            HandlerKind::Version => "version",
            HandlerKind::Shot => "shot",
        };
        f.write_str(name)
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Writes were made. The mirrored entity is last; anything resolved
    /// lazily on the way (asset, task) comes before it.
    Applied { created: Vec<EntityRef> },
    Skipped(SkipReason),
}

impl Outcome {
    pub fn applied(created: Vec<EntityRef>) -> Self {
        Outcome::Applied { created }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }

    /// The entity this event produced on the far side, if any.
    pub fn mirrored(&self) -> Option<&EntityRef> {
        match self {
            Outcome::Applied { created } => created.last(),
            Outcome::Skipped(SkipReason::AlreadyMirrored { dest }) => Some(dest),
            Outcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The event was caused by one of our own writes.
    Echo,
    /// A counterpart already exists on the destination.
    AlreadyMirrored { dest: EntityRef },
    /// Nothing left to do (e.g. every template task already present).
    UpToDate,
    /// The event is outside this handler's remit.
    NotApplicable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Echo => f.write_str("echo of our own write"),
            SkipReason::AlreadyMirrored { dest } => write!(f, "already mirrored as {dest}"),
            SkipReason::UpToDate => f.write_str("up to date"),
            SkipReason::NotApplicable(why) => write!(f, "not applicable: {why}"),
        }
    }
}

/// Reacts to an `add` event for one entity type.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Handle one event. Must be safe to call again with the same event:
    /// a replay either finds the counterpart or is suppressed as an echo.
    async fn handle(&self, engine: &SyncEngine, event: &Event) -> Result<Outcome, SyncError>;
}

/// Handlers for every mirrored entity type.
pub fn default_handlers() -> Vec<std::sync::Arc<dyn SyncHandler>> {
    vec![
        std::sync::Arc::new(TaskHandler),
        std::sync::Arc::new(NoteHandler),
        std::sync::Arc::new(VersionHandler),
        std::sync::Arc::new(ShotTemplateHandler),
    ]
}

/// Skip when `event` is the echo of one of our writes.
pub(crate) fn echo_skip(engine: &SyncEngine, event: &Event) -> Option<Outcome> {
    if engine.echo().is_echo_ref(&event.entity) {
        tracing::debug!(entity = %event.entity, "suppressed echo");
        return Some(Outcome::Skipped(SkipReason::Echo));
    }
    None
}

/// Read the entity an event refers to from its own server.
pub(crate) async fn fetch_source(
    engine: &SyncEngine,
    event: &Event,
) -> Result<mirror_core::Entity, SyncError> {
    let server = engine.server(event.side());
    server
        .api()
        .get(event.entity.kind, &event.entity.id)
        .await?
        .ok_or_else(|| SyncError::SourceMissing {
            server: server.side(),
            kind: event.entity.kind,
            id: event.entity.id.clone(),
        })
}
