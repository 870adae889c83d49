//! Domain types shared by every mirror crate.
//!
//! Entities are kept as loosely-typed field maps (`serde_json::Value`) because
//! the two tracking servers expose the same schema through a generic
//! query/create/update surface. Ids are server-local and are never compared
//! across sides.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A server-assigned entity identifier. Only meaningful on its own side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// One of the two tracking-service endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Undark,
    Pbv,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Undark, Side::Pbv];

    pub fn opposite(self) -> Side {
        match self {
            Side::Undark => Side::Pbv,
            Side::Pbv => Side::Undark,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Undark => "UNDARK",
            Side::Pbv => "PBV",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "undark" => Ok(Side::Undark),
            "pbv" => Ok(Side::Pbv),
            other => Err(format!("unknown server '{other}'; expected: undark, pbv")),
        }
    }
}

/// Source and destination of a single mirror operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Direction {
    pub from: Side,
    pub to: Side,
}

impl Direction {
    /// The direction taken by an event observed on `source`.
    pub fn from_source(source: Side) -> Self {
        Self {
            from: source,
            to: source.opposite(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.from, self.to)
    }
}

/// Entity kinds the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    /// Any structural container (sequence, shot, asset build, folder).
    Context,
    Shot,
    Task,
    Asset,
    Version,
    Note,
    User,
    TaskType,
    AssetType,
}

impl EntityKind {
    /// Entity type name on the tracking service.
    pub fn ftrack_type(self) -> &'static str {
        match self {
            EntityKind::Project => "Project",
            EntityKind::Context => "TypedContext",
            EntityKind::Shot => "Shot",
            EntityKind::Task => "Task",
            EntityKind::Asset => "Asset",
            EntityKind::Version => "AssetVersion",
            EntityKind::Note => "Note",
            EntityKind::User => "User",
            EntityKind::TaskType => "Type",
            EntityKind::AssetType => "AssetType",
        }
    }

    /// Parse a tracking-service type name, including the legacy `show` alias
    /// used for projects in event payloads.
    pub fn from_ftrack_type(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "project" | "show" => Some(EntityKind::Project),
            "typedcontext" | "context" | "sequence" | "folder" | "assetbuild" | "episode" => {
                Some(EntityKind::Context)
            }
            "shot" => Some(EntityKind::Shot),
            "task" => Some(EntityKind::Task),
            "asset" => Some(EntityKind::Asset),
            "assetversion" | "version" => Some(EntityKind::Version),
            "note" => Some(EntityKind::Note),
            "user" => Some(EntityKind::User),
            "type" | "tasktype" => Some(EntityKind::TaskType),
            "assettype" => Some(EntityKind::AssetType),
            _ => None,
        }
    }

    /// Kinds that can sit between a project and a task.
    pub fn is_container(self) -> bool {
        matches!(self, EntityKind::Context | EntityKind::Shot)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Project => "project",
            EntityKind::Context => "context",
            EntityKind::Shot => "shot",
            EntityKind::Task => "task",
            EntityKind::Asset => "asset",
            EntityKind::Version => "version",
            EntityKind::Note => "note",
            EntityKind::User => "user",
            EntityKind::TaskType => "task_type",
            EntityKind::AssetType => "asset_type",
        };
        f.write_str(name)
    }
}

/// What happened to the entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Remove,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Attribute map of a single entity.
pub type Fields = BTreeMap<String, Value>;

/// Build a [`Fields`] map from `(name, value)` pairs.
pub fn fields<K, I>(pairs: I) -> Fields
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// One entity as returned by a remote adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            kind,
            fields,
        }
    }

    /// Non-empty string attribute.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Integer attribute; accepts numeric strings.
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Reference attribute (`*_id`).
    pub fn id_field(&self, key: &str) -> Option<EntityId> {
        self.str_field(key).map(EntityId::from)
    }

    /// RFC 3339 timestamp attribute.
    pub fn timestamp_field(&self, key: &str) -> Option<DateTime<Utc>> {
        self.str_field(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn to_ref(&self, side: Side) -> EntityRef {
        EntityRef {
            side,
            kind: self.kind,
            id: self.id.clone(),
        }
    }
}

/// Identifies one entity on one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub side: Side,
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(side: Side, kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            side,
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.side, self.kind, self.id)
    }
}

/// A change notification delivered by a server subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub action: Action,
    pub entity: EntityRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityRef>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn added(entity: EntityRef) -> Self {
        Self {
            action: Action::Add,
            entity,
            parent: None,
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    /// Server the event was observed on.
    pub fn side(&self) -> Side {
        self.entity.side
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Conjunction of attribute equality clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: &EntityId) -> Self {
        Self::new().eq("id", id.0.clone())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            if field == "id" {
                return expected.as_str() == Some(entity.id.0.as_str());
            }
            match (entity.fields.get(field), expected) {
                (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
                (Some(actual), expected) => actual == expected,
                (None, Value::Null) => true,
                (None, _) => false,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn side_opposite_and_labels() {
        assert_eq!(Side::Pbv.opposite(), Side::Undark);
        assert_eq!(Side::Undark.opposite(), Side::Pbv);
        assert_eq!(Side::Pbv.to_string(), "PBV");
        assert_eq!("UNDARK".parse::<Side>().unwrap(), Side::Undark);
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::from_source(Side::Pbv).to_string(), "PBV→UNDARK");
        assert_eq!(Direction::from_source(Side::Undark).to_string(), "UNDARK→PBV");
    }

    #[test]
    fn ftrack_type_names_parse_back() {
        assert_eq!(EntityKind::from_ftrack_type("show"), Some(EntityKind::Project));
        assert_eq!(EntityKind::from_ftrack_type("AssetVersion"), Some(EntityKind::Version));
        assert_eq!(EntityKind::from_ftrack_type("Sequence"), Some(EntityKind::Context));
        assert_eq!(EntityKind::from_ftrack_type("unknown"), None);
        assert_eq!(EntityKind::Version.ftrack_type(), "AssetVersion");
    }

    #[test]
    fn entity_field_accessors() {
        let entity = Entity::new(
            EntityKind::Version,
            "v1",
            fields([
                ("version", json!("3")),
                ("comment", json!("")),
                ("asset_id", json!("a1")),
                ("date", json!("2024-05-01T10:00:00Z")),
            ]),
        );
        assert_eq!(entity.i64_field("version"), Some(3));
        assert_eq!(entity.str_field("comment"), None);
        assert_eq!(entity.id_field("asset_id"), Some(EntityId::from("a1")));
        assert!(entity.timestamp_field("date").is_some());
    }

    #[test]
    fn filter_matches_ids_and_numbers() {
        let entity = Entity::new(
            EntityKind::Version,
            "v1",
            fields([("version", json!(3)), ("asset_id", json!("a1"))]),
        );
        assert!(Filter::by_id(&EntityId::from("v1")).matches(&entity));
        assert!(Filter::new()
            .eq("version", 3)
            .eq("asset_id", "a1")
            .matches(&entity));
        assert!(!Filter::new().eq("version", 4).matches(&entity));
        assert!(!Filter::new().eq("name", "x").matches(&entity));
    }
}
