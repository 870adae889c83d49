//! Destination context resolution.
//!
//! Entities are matched across servers by business key only: project name,
//! container path, task name, asset name. Server ids never cross sides.
//!
//! ## Guarantees
//!
//! - Projects and containers are only ever looked up, never created.
//! - Tasks and assets are created lazily, each under a per-key lock with a
//!   re-check inside the lock, so concurrent resolutions of the same key
//!   produce one entity.
//! - Every entity created here is recorded with the echo suppressor before
//!   the lock is released.
//! - Nothing that already exists on the destination is modified.

use serde_json::Value;

use mirror_core::{
    fields, Entity, EntityId, EntityKind, EntityRef, Fields, Filter, RemoteError, ServerRef, Side,
};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::locks::LockKey;

/// Deepest container chain walked before the hierarchy is deemed corrupt.
const MAX_PATH_DEPTH: usize = 16;

/// Where a mirrored entity lands on the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationContext {
    pub project: Entity,
    /// Container (or the project itself) the task sits under.
    pub parent: Entity,
    pub asset: Option<Entity>,
    pub task: Option<Entity>,
    /// Entities created while resolving, in creation order.
    pub created: Vec<EntityRef>,
}

impl DestinationContext {
    fn at(project: Entity, parent: Entity) -> Self {
        Self {
            project,
            parent,
            asset: None,
            task: None,
            created: Vec::new(),
        }
    }

    pub fn project_name(&self) -> &str {
        self.project.name().unwrap_or("<unnamed>")
    }

    /// Whether `entity` was created by this resolution.
    pub fn was_created(&self, entity: &Entity) -> bool {
        self.created.iter().any(|r| r.id == entity.id && r.kind == entity.kind)
    }
}

/// Placement of a source entity, by business key.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLineage {
    pub project: Entity,
    /// Container names from the project down to the entity's parent.
    pub path: Vec<String>,
}

impl SourceLineage {
    pub fn project_name(&self) -> &str {
        self.project.name().unwrap_or("<unnamed>")
    }
}

/// Resolves context for events observed on one side, writing to the other.
pub struct Resolver<'a> {
    engine: &'a SyncEngine,
    source: Side,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(engine: &'a SyncEngine, source: Side) -> Self {
        Self { engine, source }
    }

    pub fn source(&self) -> &'a ServerRef {
        self.engine.server(self.source)
    }

    pub fn dest(&self) -> &'a ServerRef {
        self.engine.server(self.source.opposite())
    }

    /// Locate (and for tasks and versions, lazily build) the destination
    /// context for `source`. On success every referenced entity exists.
    pub async fn resolve_context(&self, source: &Entity) -> Result<DestinationContext, SyncError> {
        match source.kind {
            EntityKind::Task => {
                let lineage = self.lineage(source).await?;
                let mut ctx = self.locate(&lineage).await?;
                let task = self.ensure_task(&mut ctx, source).await?;
                ctx.task = Some(task);
                Ok(ctx)
            }
            EntityKind::Note => {
                let task = self.note_parent_task(source).await?.ok_or_else(|| {
                    self.malformed(source, "note is not attached to a task")
                })?;
                self.existing_task_context(&task).await
            }
            EntityKind::Version => self.version_context(source).await,
            other => Err(self.malformed(source, &format!("no destination context for a {other}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Source side
    // -----------------------------------------------------------------------

    /// Project and container path of `entity` on the source server.
    pub async fn lineage(&self, entity: &Entity) -> Result<SourceLineage, SyncError> {
        let src = self.source();
        let mut path = Vec::new();
        let mut cursor = entity.id_field("parent_id");

        for _ in 0..MAX_PATH_DEPTH {
            let Some(id) = cursor else {
                return self.lineage_from_project_id(entity, path).await;
            };
            if let Some(container) = src.api().get(EntityKind::Context, &id).await? {
                let name = container
                    .name()
                    .ok_or_else(|| self.malformed(&container, "container has no name"))?;
                path.push(name.to_string());
                cursor = container.id_field("parent_id");
                continue;
            }
            if let Some(project) = src.api().get(EntityKind::Project, &id).await? {
                path.reverse();
                return Ok(SourceLineage { project, path });
            }
            return Err(SyncError::SourceMissing {
                server: src.side(),
                kind: EntityKind::Context,
                id,
            });
        }
        Err(self.malformed(entity, "container hierarchy is deeper than expected"))
    }

    async fn lineage_from_project_id(
        &self,
        entity: &Entity,
        mut path: Vec<String>,
    ) -> Result<SourceLineage, SyncError> {
        let src = self.source();
        let project_id = entity
            .id_field("project_id")
            .ok_or_else(|| self.malformed(entity, "no parent_id or project_id"))?;
        let project = src
            .api()
            .get(EntityKind::Project, &project_id)
            .await?
            .ok_or(SyncError::SourceMissing {
                server: src.side(),
                kind: EntityKind::Project,
                id: project_id,
            })?;
        path.reverse();
        Ok(SourceLineage { project, path })
    }

    /// The task a source note hangs off, or `None` when the note is attached
    /// to something other than a task (project, container, version).
    pub async fn note_parent_task(&self, note: &Entity) -> Result<Option<Entity>, SyncError> {
        let src = self.source();
        let parent_id = note
            .id_field("parent_id")
            .ok_or_else(|| self.malformed(note, "note has no parent"))?;
        let declared = note
            .str_field("parent_type")
            .and_then(EntityKind::from_ftrack_type);
        let foreign = declared.is_some_and(|kind| {
            !matches!(kind, EntityKind::Task | EntityKind::Context)
        });
        if foreign {
            return Ok(None);
        }
        if let Some(task) = src.api().get(EntityKind::Task, &parent_id).await? {
            return Ok(Some(task));
        }
        if src.api().get(EntityKind::Context, &parent_id).await?.is_some() {
            return Ok(None);
        }
        Err(SyncError::SourceMissing {
            server: src.side(),
            kind: EntityKind::Task,
            id: parent_id,
        })
    }

    // -----------------------------------------------------------------------
    // Destination side: lookups
    // -----------------------------------------------------------------------

    /// Destination project named like the source one.
    pub async fn project(&self, name: &str) -> Result<Entity, SyncError> {
        let dest = self.dest();
        dest.api()
            .first(EntityKind::Project, &Filter::new().eq("name", name))
            .await?
            .ok_or_else(|| SyncError::ProjectNotFound {
                server: dest.side(),
                project: name.to_string(),
            })
    }

    /// Destination project and container matching `lineage`.
    pub async fn locate(&self, lineage: &SourceLineage) -> Result<DestinationContext, SyncError> {
        let project = self.project(lineage.project_name()).await?;
        let parent = self.container(&project, &lineage.path).await?;
        Ok(DestinationContext::at(project, parent))
    }

    async fn container(&self, project: &Entity, path: &[String]) -> Result<Entity, SyncError> {
        let dest = self.dest();
        let mut current = project.clone();
        for name in path {
            let filter = Filter::new()
                .eq("name", name.as_str())
                .eq("parent_id", current.id.0.clone());
            current = dest
                .api()
                .first(EntityKind::Context, &filter)
                .await?
                .ok_or_else(|| SyncError::ParentNotFound {
                    server: dest.side(),
                    project: project.name().unwrap_or_default().to_string(),
                    parent: path.join("/"),
                })?;
        }
        Ok(current)
    }

    /// Destination task named `name` directly under `parent`.
    pub async fn find_task(
        &self,
        parent: &Entity,
        name: &str,
    ) -> Result<Option<Entity>, SyncError> {
        Ok(self
            .dest()
            .api()
            .first(EntityKind::Task, &task_filter(parent, name))
            .await?)
    }

    /// Context of a source task that must already exist on the destination.
    pub async fn existing_task_context(
        &self,
        task: &Entity,
    ) -> Result<DestinationContext, SyncError> {
        let name = task
            .name()
            .ok_or_else(|| self.malformed(task, "task has no name"))?;
        let lineage = self.lineage(task).await?;
        let mut ctx = self.locate(&lineage).await?;
        let found = self
            .find_task(&ctx.parent, name)
            .await?
            .ok_or_else(|| SyncError::ParentNotFound {
                server: self.dest().side(),
                project: lineage.project_name().to_string(),
                parent: qualified(&lineage.path, name),
            })?;
        ctx.task = Some(found);
        Ok(ctx)
    }

    // -----------------------------------------------------------------------
    // Destination side: lazy creation
    // -----------------------------------------------------------------------

    /// Destination task matching `source_task` under `ctx.parent`, created
    /// when absent. Creation is appended to `ctx.created`.
    pub async fn ensure_task(
        &self,
        ctx: &mut DestinationContext,
        source_task: &Entity,
    ) -> Result<Entity, SyncError> {
        let dest = self.dest();
        let name = source_task
            .name()
            .ok_or_else(|| self.malformed(source_task, "task has no name"))?;
        let filter = task_filter(&ctx.parent, name);
        if let Some(existing) = dest.api().first(EntityKind::Task, &filter).await? {
            return Ok(existing);
        }

        let mut new_task = fields([
            ("name", Value::from(name)),
            ("parent_id", Value::from(ctx.parent.id.0.clone())),
            ("project_id", Value::from(ctx.project.id.0.clone())),
        ]);
        if let Some(type_id) = self.matched_task_type(source_task).await? {
            new_task.insert("type_id".to_string(), Value::from(type_id.0));
        }

        let key = LockKey::new(dest.side(), EntityKind::Task, ctx.parent.id.0.clone(), name);
        let (task, created) = self
            .create_once(EntityKind::Task, &filter, &key, new_task)
            .await?;
        if created {
            ctx.created.push(task.to_ref(dest.side()));
        }
        Ok(task)
    }

    /// Destination asset named like `source_asset` in `ctx.project`, created
    /// when absent with the same asset type name when the destination has it.
    pub async fn ensure_asset(
        &self,
        ctx: &mut DestinationContext,
        source_asset: &Entity,
    ) -> Result<Entity, SyncError> {
        let dest = self.dest();
        let name = source_asset
            .name()
            .ok_or_else(|| self.malformed(source_asset, "asset has no name"))?;
        let filter = Filter::new()
            .eq("name", name)
            .eq("project_id", ctx.project.id.0.clone());
        if let Some(existing) = dest.api().first(EntityKind::Asset, &filter).await? {
            return Ok(existing);
        }

        let mut new_asset = fields([
            ("name", Value::from(name)),
            ("parent_id", Value::from(ctx.project.id.0.clone())),
            ("project_id", Value::from(ctx.project.id.0.clone())),
        ]);
        if let Some(type_id) = self
            .matched_type(EntityKind::AssetType, source_asset.id_field("type_id"))
            .await?
        {
            new_asset.insert("type_id".to_string(), Value::from(type_id.0));
        }

        let key = LockKey::new(dest.side(), EntityKind::Asset, ctx.project.id.0.clone(), name);
        let (asset, created) = self
            .create_once(EntityKind::Asset, &filter, &key, new_asset)
            .await?;
        if created {
            ctx.created.push(asset.to_ref(dest.side()));
        }
        Ok(asset)
    }

    /// Check-then-create under the lock for `key`. Returns the entity and
    /// whether this call created it. A server-side conflict means another
    /// writer won the race: re-read and use its entity.
    pub(crate) async fn create_once(
        &self,
        kind: EntityKind,
        filter: &Filter,
        key: &LockKey,
        new_fields: Fields,
    ) -> Result<(Entity, bool), SyncError> {
        let dest = self.dest();
        let _guard = self.engine.locks().acquire(key).await;

        if let Some(existing) = dest.api().first(kind, filter).await? {
            return Ok((existing, false));
        }

        match dest.api().create(kind, new_fields).await {
            Ok(created) => {
                self.engine.record_write(&created.to_ref(dest.side()));
                tracing::info!(
                    server = %dest.side(),
                    kind = %kind,
                    id = %created.id,
                    key = %key,
                    "created on destination",
                );
                Ok((created, true))
            }
            Err(RemoteError::Conflict { message, .. }) => {
                tracing::warn!(key = %key, %message, "create conflicted, re-reading winner");
                let winner = dest.api().first(kind, filter).await?;
                winner
                    .map(|entity| (entity, false))
                    .ok_or_else(|| SyncError::ConcurrentCreateConflict {
                        server: dest.side(),
                        kind,
                        key: key.to_string(),
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn version_context(&self, version: &Entity) -> Result<DestinationContext, SyncError> {
        let src = self.source();
        let asset_id = version
            .id_field("asset_id")
            .ok_or_else(|| self.malformed(version, "version has no asset"))?;
        let source_asset = src
            .api()
            .get(EntityKind::Asset, &asset_id)
            .await?
            .ok_or(SyncError::SourceMissing {
                server: src.side(),
                kind: EntityKind::Asset,
                id: asset_id,
            })?;

        let asset_lineage = self.lineage(&source_asset).await?;
        let project = self.project(asset_lineage.project_name()).await?;

        // Everything that can fail permanently is looked up before the first write.
        let task_placement = match version.id_field("task_id") {
            Some(task_id) => {
                let source_task = src
                    .api()
                    .get(EntityKind::Task, &task_id)
                    .await?
                    .ok_or(SyncError::SourceMissing {
                        server: src.side(),
                        kind: EntityKind::Task,
                        id: task_id,
                    })?;
                let task_lineage = self.lineage(&source_task).await?;
                let container = self.container(&project, &task_lineage.path).await?;
                Some((source_task, container))
            }
            None => None,
        };

        let mut ctx = DestinationContext::at(project.clone(), project);
        let asset = self.ensure_asset(&mut ctx, &source_asset).await?;
        ctx.asset = Some(asset);

        if let Some((source_task, container)) = task_placement {
            ctx.parent = container;
            let task = self.ensure_task(&mut ctx, &source_task).await?;
            ctx.task = Some(task);
        }
        Ok(ctx)
    }

    // -----------------------------------------------------------------------
    // Type matching
    // -----------------------------------------------------------------------

    /// Destination task type with the source task's type name, else the
    /// configured default type, else none.
    async fn matched_task_type(&self, source_task: &Entity) -> Result<Option<EntityId>, SyncError> {
        if let Some(id) = self
            .matched_type(EntityKind::TaskType, source_task.id_field("type_id"))
            .await?
        {
            return Ok(Some(id));
        }
        let default = &self.engine.settings().default_task_type;
        let fallback = self
            .dest()
            .api()
            .first(EntityKind::TaskType, &Filter::new().eq("name", default.as_str()))
            .await?;
        if fallback.is_none() {
            tracing::warn!(
                server = %self.dest().side(),
                default_type = %default,
                "default task type missing on destination; creating untyped task",
            );
        }
        Ok(fallback.map(|t| t.id))
    }

    async fn matched_type(
        &self,
        kind: EntityKind,
        source_type: Option<EntityId>,
    ) -> Result<Option<EntityId>, SyncError> {
        let Some(source_type) = source_type else {
            return Ok(None);
        };
        let Some(type_name) = self
            .source()
            .api()
            .get(kind, &source_type)
            .await?
            .and_then(|t| t.name().map(str::to_string))
        else {
            return Ok(None);
        };
        let matched = self
            .dest()
            .api()
            .first(kind, &Filter::new().eq("name", type_name.as_str()))
            .await?;
        Ok(matched.map(|t| t.id))
    }

    fn malformed(&self, entity: &Entity, reason: &str) -> SyncError {
        SyncError::Malformed {
            server: self.source,
            kind: entity.kind,
            id: entity.id.clone(),
            reason: reason.to_string(),
        }
    }
}

fn task_filter(parent: &Entity, name: &str) -> Filter {
    Filter::new()
        .eq("name", name)
        .eq("parent_id", parent.id.0.clone())
}

fn qualified(path: &[String], name: &str) -> String {
    path.iter()
        .map(String::as_str)
        .chain(std::iter::once(name))
        .collect::<Vec<_>>()
        .join("/")
}
