//! In-process tracking service.
//!
//! Behaves like a remote server from the engine's point of view: it assigns
//! ids, emits an `add` event for every create (including the engine's own
//! writes, which is exactly what produces echoes), and counts writes per
//! kind. Used by the test suites and by `trackmirror run --memory`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::adapter::RemoteAdapter;
use crate::error::RemoteError;
use crate::types::{Action, Entity, EntityId, EntityKind, EntityRef, Event, Fields, Filter, Side};

const EVENT_BUFFER: usize = 1024;

pub struct MemoryServer {
    side: Side,
    state: Mutex<MemoryState>,
    events: broadcast::Sender<Event>,
}

#[derive(Default)]
struct MemoryState {
    entities: BTreeMap<EntityId, Entity>,
    next_id: u64,
    creates: HashMap<EntityKind, usize>,
    failures: VecDeque<RemoteError>,
    unique_names: HashSet<EntityKind>,
    latency: Duration,
}

impl MemoryServer {
    pub fn new(side: Side) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            side,
            state: Mutex::new(MemoryState::default()),
            events,
        })
    }

    /// Insert an entity without emitting an event or counting a write.
    pub fn seed(&self, kind: EntityKind, fields: Fields) -> Entity {
        let mut state = self.lock();
        self.insert(&mut state, kind, fields)
    }

    /// Deliver `event` to every subscriber, as a server redelivery would.
    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Number of creates performed through the adapter interface.
    pub fn create_count(&self, kind: EntityKind) -> usize {
        self.lock().creates.get(&kind).copied().unwrap_or(0)
    }

    /// All stored entities of exactly `kind`, in creation order.
    pub fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.lock()
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn find(&self, kind: EntityKind, filter: &Filter) -> Vec<Entity> {
        let state = self.lock();
        Self::matching(&state, kind, filter)
    }

    /// Fail the next adapter call with `err`.
    pub fn fail_next(&self, err: RemoteError) {
        self.lock().failures.push_back(err);
    }

    /// Reject creates of `kind` that repeat an existing (name, parent) pair,
    /// like a server-side uniqueness constraint.
    pub fn require_unique_names(&self, kind: EntityKind) {
        self.lock().unique_names.insert(kind);
    }

    /// Delay every adapter call, to widen race windows in tests.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the map is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_call(&self) -> Result<(), RemoteError> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.lock().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn insert(&self, state: &mut MemoryState, kind: EntityKind, mut fields: Fields) -> Entity {
        state.next_id += 1;
        let prefix = match self.side {
            Side::Undark => "undark",
            Side::Pbv => "pbv",
        };
        let id = EntityId(format!("{prefix}-{:06}", state.next_id));
        let now = Utc::now().to_rfc3339();
        fields
            .entry("created_at".to_string())
            .or_insert_with(|| Value::String(now.clone()));
        if matches!(kind, EntityKind::Note | EntityKind::Version) {
            fields
                .entry("date".to_string())
                .or_insert_with(|| Value::String(now));
        }
        let entity = Entity::new(kind, id.clone(), fields);
        state.entities.insert(id, entity.clone());
        entity
    }

    fn matching(state: &MemoryState, kind: EntityKind, filter: &Filter) -> Vec<Entity> {
        state
            .entities
            .values()
            .filter(|e| e.kind == kind || (kind == EntityKind::Context && e.kind.is_container()))
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    fn check_unique(
        &self,
        state: &MemoryState,
        kind: EntityKind,
        fields: &Fields,
    ) -> Result<(), RemoteError> {
        if !state.unique_names.contains(&kind) {
            return Ok(());
        }
        let (Some(name), parent) = (fields.get("name"), fields.get("parent_id")) else {
            return Ok(());
        };
        let duplicate = state.entities.values().any(|e| {
            e.kind == kind
                && e.fields.get("name") == Some(name)
                && e.fields.get("parent_id") == parent
        });
        if duplicate {
            return Err(RemoteError::Conflict {
                server: self.side,
                kind,
                message: format!("{kind} named {name} already exists under this parent"),
            });
        }
        Ok(())
    }

    fn event_for(&self, state: &MemoryState, action: Action, entity: &Entity) -> Event {
        let parent = entity.id_field("parent_id").and_then(|parent_id| {
            let kind = state
                .entities
                .get(&parent_id)
                .map(|p| p.kind)
                .or_else(|| {
                    entity
                        .str_field("parent_type")
                        .and_then(EntityKind::from_ftrack_type)
                })?;
            Some(EntityRef::new(self.side, kind, parent_id))
        });
        Event {
            action,
            entity: entity.to_ref(self.side),
            parent,
            timestamp: Utc::now(),
            payload: serde_json::to_value(&entity.fields).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl RemoteAdapter for MemoryServer {
    fn side(&self) -> Side {
        self.side
    }

    async fn query(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>, RemoteError> {
        self.simulate_call().await?;
        Ok(self.find(kind, filter))
    }

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<Entity, RemoteError> {
        self.simulate_call().await?;
        let (entity, event) = {
            let mut state = self.lock();
            self.check_unique(&state, kind, &fields)?;
            let entity = self.insert(&mut state, kind, fields);
            *state.creates.entry(kind).or_default() += 1;
            let event = self.event_for(&state, Action::Add, &entity);
            (entity, event)
        };
        self.emit(event);
        Ok(entity)
    }

    async fn create_batch(
        &self,
        kind: EntityKind,
        batch: Vec<Fields>,
    ) -> Result<Vec<Entity>, RemoteError> {
        self.simulate_call().await?;
        let (created, events) = {
            let mut state = self.lock();
            for fields in &batch {
                self.check_unique(&state, kind, fields)?;
            }
            let mut created = Vec::with_capacity(batch.len());
            let mut events = Vec::with_capacity(batch.len());
            for fields in batch {
                let entity = self.insert(&mut state, kind, fields);
                *state.creates.entry(kind).or_default() += 1;
                events.push(self.event_for(&state, Action::Add, &entity));
                created.push(entity);
            }
            (created, events)
        };
        for event in events {
            self.emit(event);
        }
        Ok(created)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        fields: Fields,
    ) -> Result<Entity, RemoteError> {
        self.simulate_call().await?;
        let (entity, event) = {
            let mut state = self.lock();
            let entity = match state.entities.get_mut(id) {
                Some(entity) if entity.kind == kind => {
                    entity.fields.extend(fields);
                    entity.clone()
                }
                _ => {
                    return Err(RemoteError::NotFound {
                        server: self.side,
                        kind,
                        id: id.clone(),
                    })
                }
            };
            let event = self.event_for(&state, Action::Update, &entity);
            (entity, event)
        };
        self.emit(event);
        Ok(entity)
    }

    async fn subscribe(&self, kinds: &[EntityKind]) -> Result<mpsc::Receiver<Event>, RemoteError> {
        let mut events = self.events.subscribe();
        let kinds: Vec<EntityKind> = kinds.to_vec();
        let side = self.side;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !kinds.contains(&event.entity.kind) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(server = %side, skipped, "memory subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fields;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_ids_and_emits_add_events() {
        let server = MemoryServer::new(Side::Pbv);
        let project = server.seed(EntityKind::Project, fields([("name", json!("show"))]));
        let mut events = server.subscribe(&[EntityKind::Task]).await.expect("subscribe");

        let task = server
            .create(
                EntityKind::Task,
                fields([("name", json!("comp")), ("parent_id", json!(project.id.0))]),
            )
            .await
            .expect("create");

        let event = events.recv().await.expect("event");
        assert_eq!(event.action, Action::Add);
        assert_eq!(event.entity, task.to_ref(Side::Pbv));
        assert_eq!(event.parent.map(|p| p.kind), Some(EntityKind::Project));
        assert_eq!(server.create_count(EntityKind::Task), 1);
        assert_eq!(server.create_count(EntityKind::Project), 0);
    }

    #[tokio::test]
    async fn context_queries_match_every_container_kind() {
        let server = MemoryServer::new(Side::Undark);
        server.seed(EntityKind::Shot, fields([("name", json!("sh010"))]));
        server.seed(EntityKind::Context, fields([("name", json!("sq01"))]));
        let found = server
            .query(EntityKind::Context, &Filter::new())
            .await
            .expect("query");
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn unique_names_reject_duplicates() {
        let server = MemoryServer::new(Side::Undark);
        server.require_unique_names(EntityKind::Task);
        let fields = fields([("name", json!("comp")), ("parent_id", json!("p1"))]);
        server
            .create(EntityKind::Task, fields.clone())
            .await
            .expect("first create");
        let err = server.create(EntityKind::Task, fields).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let server = MemoryServer::new(Side::Pbv);
        server.fail_next(RemoteError::Transient {
            server: Side::Pbv,
            message: "connection reset".to_string(),
        });
        assert!(server.query(EntityKind::Task, &Filter::new()).await.is_err());
        assert!(server.query(EntityKind::Task, &Filter::new()).await.is_ok());
    }
}
