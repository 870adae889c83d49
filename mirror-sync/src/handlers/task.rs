//! PBV asset-request tasks mirrored to UNDARK.

use async_trait::async_trait;

use mirror_core::{Event, Side};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::handlers::{echo_skip, fetch_source, HandlerKind, Outcome, SkipReason, SyncHandler};

/// Only PBV creates tasks that UNDARK needs; the reverse direction is never
/// written.
const SOURCE_SIDE: Side = Side::Pbv;

#[derive(Debug, Default, Clone, Copy)]
pub struct TaskHandler;

#[async_trait]
impl SyncHandler for TaskHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Task
    }

    async fn handle(&self, engine: &SyncEngine, event: &Event) -> Result<Outcome, SyncError> {
        if event.side() != SOURCE_SIDE {
            return Ok(Outcome::Skipped(SkipReason::NotApplicable(format!(
                "tasks are only mirrored from {SOURCE_SIDE}"
            ))));
        }
        if let Some(skip) = echo_skip(engine, event) {
            return Ok(skip);
        }

        let task = fetch_source(engine, event).await?;
        let marker = &engine.settings().asset_request_marker;
        let is_request = task
            .name()
            .is_some_and(|name| name.to_lowercase().contains(&marker.to_lowercase()));
        if !is_request {
            return Ok(Outcome::Skipped(SkipReason::NotApplicable(format!(
                "task name lacks the '{marker}' marker"
            ))));
        }

        let resolver = engine.resolver(event.side());
        let ctx = resolver.resolve_context(&task).await?;
        let Some(mirrored) = ctx.task.as_ref() else {
            return Ok(Outcome::Skipped(SkipReason::UpToDate));
        };
        let dest = mirrored.to_ref(resolver.dest().side());

        if !ctx.was_created(mirrored) {
            tracing::debug!(source = %event.entity, %dest, "task already mirrored");
            return Ok(Outcome::Skipped(SkipReason::AlreadyMirrored { dest }));
        }
        tracing::info!(
            source = %event.entity,
            %dest,
            project = ctx.project_name(),
            task = task.name().unwrap_or_default(),
            "mirrored asset request",
        );
        Ok(Outcome::applied(ctx.created))
    }
}
