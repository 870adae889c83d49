//! Task notes mirrored in both directions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use mirror_core::{fields, Entity, EntityId, EntityKind, Event, Filter};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::handlers::{echo_skip, fetch_source, HandlerKind, Outcome, SkipReason, SyncHandler};
use crate::locks::LockKey;
use crate::resolver::Resolver;

/// Body written when a note has neither subject nor content.
pub const EMPTY_NOTE_BODY: &str = "No content";

#[derive(Debug, Default, Clone, Copy)]
pub struct NoteHandler;

#[async_trait]
impl SyncHandler for NoteHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Note
    }

    async fn handle(&self, engine: &SyncEngine, event: &Event) -> Result<Outcome, SyncError> {
        if let Some(skip) = echo_skip(engine, event) {
            return Ok(skip);
        }

        let note = fetch_source(engine, event).await?;
        let resolver = engine.resolver(event.side());
        let Some(source_task) = resolver.note_parent_task(&note).await? else {
            return Ok(Outcome::Skipped(SkipReason::NotApplicable(
                "note is not attached to a task".to_string(),
            )));
        };

        let ctx = resolver.existing_task_context(&source_task).await?;
        let Some(dest_task) = ctx.task.as_ref() else {
            return Ok(Outcome::Skipped(SkipReason::UpToDate));
        };

        let body = compose_body(note.str_field("subject"), note.str_field("content"));
        let author = map_author(&resolver, &note).await?;

        let dest = resolver.dest();
        let key = LockKey::new(dest.side(), EntityKind::Note, dest_task.id.0.clone(), body.clone());
        let _guard = engine.locks().acquire(&key).await;

        let window = chrono::Duration::from_std(engine.settings().note_match_window())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let existing = dest
            .api()
            .query(EntityKind::Note, &Filter::new().eq("parent_id", dest_task.id.0.clone()))
            .await?
            .into_iter()
            .find(|candidate| {
                is_same_note(
                    candidate,
                    &body,
                    author.as_ref(),
                    note.timestamp_field("date"),
                    window,
                )
            });
        if let Some(existing) = existing {
            let dest_ref = existing.to_ref(dest.side());
            tracing::debug!(source = %event.entity, dest = %dest_ref, "note already mirrored");
            return Ok(Outcome::Skipped(SkipReason::AlreadyMirrored { dest: dest_ref }));
        }

        let mut new_note = fields([
            ("content", Value::from(body)),
            ("parent_id", Value::from(dest_task.id.0.clone())),
            ("parent_type", Value::from(EntityKind::Task.ftrack_type())),
        ]);
        if let Some(author) = &author {
            new_note.insert("user_id".to_string(), Value::from(author.0.clone()));
        }
        let created = dest.api().create(EntityKind::Note, new_note).await?;
        let dest_ref = created.to_ref(dest.side());
        engine.record_write(&dest_ref);

        tracing::info!(
            source = %event.entity,
            dest = %dest_ref,
            project = ctx.project_name(),
            task = dest_task.name().unwrap_or_default(),
            author_mapped = author.is_some(),
            "mirrored note",
        );
        Ok(Outcome::applied(vec![dest_ref]))
    }
}

/// `"{subject}\n\n{content}"`, or whichever part is present, or
/// [`EMPTY_NOTE_BODY`].
pub fn compose_body(subject: Option<&str>, content: Option<&str>) -> String {
    let subject = subject.map(str::trim).filter(|s| !s.is_empty());
    let content = content.unwrap_or_default();
    let composed = match subject {
        Some(subject) => format!("{subject}\n\n{content}"),
        None => content.to_string(),
    };
    if composed.trim().is_empty() {
        EMPTY_NOTE_BODY.to_string()
    } else {
        composed
    }
}

/// Destination user with the source author's username.
async fn map_author(resolver: &Resolver<'_>, note: &Entity) -> Result<Option<EntityId>, SyncError> {
    let Some(user_id) = note.id_field("user_id") else {
        return Ok(None);
    };
    let Some(username) = resolver
        .source()
        .api()
        .get(EntityKind::User, &user_id)
        .await?
        .and_then(|u| u.str_field("username").map(str::to_string))
    else {
        return Ok(None);
    };
    let user = resolver
        .dest()
        .api()
        .first(EntityKind::User, &Filter::new().eq("username", username.as_str()))
        .await?;
    if user.is_none() {
        tracing::debug!(%username, "note author has no account on destination");
    }
    Ok(user.map(|u| u.id))
}

fn is_same_note(
    candidate: &Entity,
    body: &str,
    author: Option<&EntityId>,
    source_date: Option<DateTime<Utc>>,
    window: chrono::Duration,
) -> bool {
    let content_matches = candidate.str_field("content").is_some_and(|content| {
        content == body
            || compose_body(candidate.str_field("subject"), Some(content)) == body
    });
    if !content_matches {
        return false;
    }
    if let Some(author) = author {
        if candidate.id_field("user_id").as_ref() != Some(author) {
            return false;
        }
    }
    match (source_date, candidate.timestamp_field("date")) {
        (Some(source), Some(dest)) => {
            let delta = dest - source;
            delta <= window && delta >= -window
        }
        _ => true,
    }
}
