//! Standard task template applied to newly created shots.
//!
//! Writes go to the server the shot was created on, not across.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use mirror_core::retry::poll_until;
use mirror_core::{fields, Entity, EntityKind, Event, Fields, Filter, ServerRef};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::handlers::{HandlerKind, Outcome, SkipReason, SyncHandler};
use crate::locks::LockKey;

#[derive(Debug, Default, Clone, Copy)]
pub struct ShotTemplateHandler;

#[async_trait]
impl SyncHandler for ShotTemplateHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Shot
    }

    async fn handle(&self, engine: &SyncEngine, event: &Event) -> Result<Outcome, SyncError> {
        let template = &engine.settings().shot_template;
        if !template.enabled || !template.sides.contains(&event.side()) {
            return Ok(Outcome::Skipped(SkipReason::NotApplicable(format!(
                "shot template disabled on {}",
                event.side()
            ))));
        }

        let server = engine.server(event.side());
        let label = format!("refetch shot {}", event.entity.id);
        let shot = poll_until(&template.refetch_policy(), &label, |_| {
            server.api().get(EntityKind::Shot, &event.entity.id)
        })
        .await?
        .ok_or_else(|| SyncError::SourceMissing {
            server: server.side(),
            kind: EntityKind::Shot,
            id: event.entity.id.clone(),
        })?;

        let key = LockKey::new(server.side(), EntityKind::Task, shot.id.0.clone(), "template");
        let _guard = engine.locks().acquire(&key).await;

        let missing = missing_template_tasks(server, &shot, &template.task_types).await?;
        if missing.is_empty() {
            tracing::debug!(shot = %event.entity, "template tasks already present");
            return Ok(Outcome::Skipped(SkipReason::UpToDate));
        }

        let mut batch = Vec::with_capacity(missing.len());
        for name in &missing {
            batch.push(template_task(server, &shot, name).await?);
        }
        let created = server.api().create_batch(EntityKind::Task, batch).await?;
        let refs: Vec<_> = created.iter().map(|task| task.to_ref(server.side())).collect();
        for task in &refs {
            engine.record_write(task);
        }

        tracing::info!(
            shot = %event.entity,
            name = shot.name().unwrap_or_default(),
            tasks = %missing.join(", "),
            "applied shot task template",
        );
        Ok(Outcome::applied(refs))
    }
}

/// Template names with no same-named (case-insensitive) task under `shot`,
/// in template order.
async fn missing_template_tasks(
    server: &ServerRef,
    shot: &Entity,
    template: &[String],
) -> Result<Vec<String>, SyncError> {
    let existing: HashSet<String> = server
        .api()
        .query(EntityKind::Task, &Filter::new().eq("parent_id", shot.id.0.clone()))
        .await?
        .iter()
        .filter_map(|task| task.name().map(str::to_lowercase))
        .collect();
    Ok(template
        .iter()
        .filter(|name| !existing.contains(&name.to_lowercase()))
        .cloned()
        .collect())
}

async fn template_task(server: &ServerRef, shot: &Entity, name: &str) -> Result<Fields, SyncError> {
    let mut task = fields([
        ("name", Value::from(name)),
        ("parent_id", Value::from(shot.id.0.clone())),
    ]);
    if let Some(project_id) = shot.id_field("project_id") {
        task.insert("project_id".to_string(), Value::from(project_id.0));
    }
    let task_type = server
        .api()
        .first(EntityKind::TaskType, &Filter::new().eq("name", name))
        .await?;
    match task_type {
        Some(task_type) => {
            task.insert("type_id".to_string(), Value::from(task_type.id.0));
        }
        None => tracing::warn!(server = %server.side(), task_type = name, "task type not defined"),
    }
    Ok(task)
}
