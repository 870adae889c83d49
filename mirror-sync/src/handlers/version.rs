//! Asset versions mirrored in both directions.

use async_trait::async_trait;
use serde_json::Value;

use mirror_core::{Entity, EntityKind, Event, Fields, Filter};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::handlers::{echo_skip, fetch_source, HandlerKind, Outcome, SkipReason, SyncHandler};
use crate::locks::LockKey;

/// Attribute map that carries pipeline metadata on a version.
const METADATA_FIELD: &str = "custom_attributes";

#[derive(Debug, Default, Clone, Copy)]
pub struct VersionHandler;

#[async_trait]
impl SyncHandler for VersionHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Version
    }

    async fn handle(&self, engine: &SyncEngine, event: &Event) -> Result<Outcome, SyncError> {
        if let Some(skip) = echo_skip(engine, event) {
            return Ok(skip);
        }

        let version = fetch_source(engine, event).await?;
        let number = version.i64_field("version");
        let name = version
            .name()
            .map(str::to_string)
            .or_else(|| number.map(|n| format!("v{n}")));
        let Some(identity) = number.map(|n| format!("v{n}")).or_else(|| name.clone()) else {
            return Err(SyncError::Malformed {
                server: event.side(),
                kind: EntityKind::Version,
                id: version.id.clone(),
                reason: "version has neither number nor name".to_string(),
            });
        };

        let resolver = engine.resolver(event.side());
        let mut ctx = resolver.resolve_context(&version).await?;
        let Some(asset) = ctx.asset.clone() else {
            return Ok(Outcome::Skipped(SkipReason::UpToDate));
        };

        let dest = resolver.dest();
        let filter = match number {
            Some(n) => Filter::new().eq("asset_id", asset.id.0.clone()).eq("version", n),
            None => Filter::new()
                .eq("asset_id", asset.id.0.clone())
                .eq("name", identity.as_str()),
        };
        let key = LockKey::new(
            dest.side(),
            EntityKind::Version,
            asset.id.0.clone(),
            identity.as_str(),
        );
        let new_version = version_fields(
            &version,
            &asset,
            ctx.task.as_ref(),
            name.as_deref(),
            &engine.settings().version_metadata_keys,
        );
        let (mirrored, created) = resolver
            .create_once(EntityKind::Version, &filter, &key, new_version)
            .await?;
        let dest_ref = mirrored.to_ref(dest.side());

        if !created {
            tracing::info!(
                source = %event.entity,
                dest = %dest_ref,
                asset = asset.name().unwrap_or_default(),
                version = %identity,
                "version already exists on destination",
            );
            if ctx.created.is_empty() {
                return Ok(Outcome::Skipped(SkipReason::AlreadyMirrored { dest: dest_ref }));
            }
            return Ok(Outcome::applied(ctx.created));
        }

        tracing::info!(
            source = %event.entity,
            dest = %dest_ref,
            project = ctx.project_name(),
            asset = asset.name().unwrap_or_default(),
            task = ctx.task.as_ref().and_then(Entity::name).unwrap_or_default(),
            version = %identity,
            "mirrored version",
        );
        ctx.created.push(dest_ref);
        Ok(Outcome::applied(ctx.created))
    }
}

fn version_fields(
    source: &Entity,
    asset: &Entity,
    task: Option<&Entity>,
    name: Option<&str>,
    metadata_keys: &[String],
) -> Fields {
    let mut out = Fields::new();
    out.insert("asset_id".to_string(), Value::from(asset.id.0.clone()));
    if let Some(task) = task {
        out.insert("task_id".to_string(), Value::from(task.id.0.clone()));
    }
    if let Some(number) = source.i64_field("version") {
        out.insert("version".to_string(), Value::from(number));
    }
    if let Some(name) = name {
        out.insert("name".to_string(), Value::from(name));
    }
    if let Some(comment) = source.str_field("comment") {
        out.insert("comment".to_string(), Value::from(comment));
    }
    let metadata = copy_metadata(source, metadata_keys);
    if !metadata.is_empty() {
        out.insert(METADATA_FIELD.to_string(), Value::Object(metadata));
    }
    out
}

/// Configured metadata keys present on `source`, copied verbatim.
fn copy_metadata(source: &Entity, keys: &[String]) -> serde_json::Map<String, Value> {
    let Some(Value::Object(attrs)) = source.fields.get(METADATA_FIELD) else {
        return serde_json::Map::new();
    };
    keys.iter()
        .filter_map(|key| {
            attrs
                .get(key)
                .filter(|v| !v.is_null())
                .map(|v| (key.clone(), v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::fields;
    use serde_json::json;

    #[test]
    fn only_configured_metadata_is_copied() {
        let source = Entity::new(
            EntityKind::Version,
            "v1",
            fields([
                ("version", json!(3)),
                ("comment", json!("approved")),
                (
                    METADATA_FIELD,
                    json!({"product": "lighting_fix", "fps": 24, "department": null}),
                ),
            ]),
        );
        let asset = Entity::new(EntityKind::Asset, "a1", Fields::new());
        let keys = vec!["product".to_string(), "department".to_string()];

        let out = version_fields(&source, &asset, None, Some("v3"), &keys);
        assert_eq!(out["custom_attributes"], json!({"product": "lighting_fix"}));
        assert_eq!(out["version"], json!(3));
        assert_eq!(out["name"], json!("v3"));
        assert_eq!(out["comment"], json!("approved"));
        assert!(!out.contains_key("task_id"));
    }
}
