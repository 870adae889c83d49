#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use mirror_core::{
    fields, Entity, EntityKind, Event, Fields, MemoryServer, RemoteAdapter, Servers, Side,
    SyncSettings,
};
use mirror_sync::{Dispatcher, SyncEngine};

pub const PROJECT: &str = "chr_show";

/// Shared hierarchy seeded on one server.
pub struct Layout {
    pub project: Entity,
    pub sequence: Entity,
    pub shot: Entity,
}

/// Two in-memory servers with the same project tree, plus an engine.
pub struct World {
    pub undark: Arc<MemoryServer>,
    pub pbv: Arc<MemoryServer>,
    pub undark_layout: Layout,
    pub pbv_layout: Layout,
    pub engine: Arc<SyncEngine>,
    pub dispatcher: Arc<Dispatcher>,
}

impl World {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let undark = MemoryServer::new(Side::Undark);
        let pbv = MemoryServer::new(Side::Pbv);
        Self::from_servers(undark.clone(), pbv.clone(), undark, pbv, settings)
    }

    /// Build over arbitrary adapters; the memory servers are used for seeding
    /// and assertions.
    pub fn from_servers(
        undark: Arc<MemoryServer>,
        pbv: Arc<MemoryServer>,
        undark_api: Arc<dyn RemoteAdapter>,
        pbv_api: Arc<dyn RemoteAdapter>,
        settings: SyncSettings,
    ) -> Self {
        let undark_layout = seed_layout(&undark);
        let pbv_layout = seed_layout(&pbv);
        let servers = Servers::new(undark_api, pbv_api).expect("servers");
        let engine = Arc::new(SyncEngine::new(servers, settings));
        let dispatcher = Arc::new(Dispatcher::new(engine.clone()));
        Self {
            undark,
            pbv,
            undark_layout,
            pbv_layout,
            engine,
            dispatcher,
        }
    }

    pub fn server(&self, side: Side) -> &Arc<MemoryServer> {
        match side {
            Side::Undark => &self.undark,
            Side::Pbv => &self.pbv,
        }
    }

    pub fn layout(&self, side: Side) -> &Layout {
        match side {
            Side::Undark => &self.undark_layout,
            Side::Pbv => &self.pbv_layout,
        }
    }

    /// Seed a task under the shot on `side`.
    pub fn seed_task(&self, side: Side, name: &str) -> Entity {
        let layout = self.layout(side);
        let server = self.server(side);
        let type_id = type_id(server, EntityKind::TaskType, "Compositing");
        server.seed(
            EntityKind::Task,
            fields([
                ("name", json!(name)),
                ("parent_id", json!(layout.shot.id.0)),
                ("project_id", json!(layout.project.id.0)),
                ("type_id", json!(type_id)),
            ]),
        )
    }

    pub fn seed_user(&self, side: Side, username: &str) -> Entity {
        self.server(side)
            .seed(EntityKind::User, fields([("username", json!(username))]))
    }

    pub fn seed_note(&self, side: Side, task: &Entity, extra: Fields) -> Entity {
        let mut note = fields([
            ("parent_id", json!(task.id.0)),
            ("parent_type", json!("Task")),
        ]);
        note.extend(extra);
        self.server(side).seed(EntityKind::Note, note)
    }

    pub fn seed_asset(&self, side: Side, name: &str) -> Entity {
        let layout = self.layout(side);
        let server = self.server(side);
        let type_id = type_id(server, EntityKind::AssetType, "Render");
        server.seed(
            EntityKind::Asset,
            fields([
                ("name", json!(name)),
                ("parent_id", json!(layout.project.id.0)),
                ("project_id", json!(layout.project.id.0)),
                ("type_id", json!(type_id)),
            ]),
        )
    }

    pub fn seed_version(
        &self,
        side: Side,
        asset: &Entity,
        task: Option<&Entity>,
        extra: Fields,
    ) -> Entity {
        let mut version = fields([("asset_id", json!(asset.id.0))]);
        if let Some(task) = task {
            version.insert("task_id".to_string(), json!(task.id.0));
        }
        version.extend(extra);
        self.server(side).seed(EntityKind::Version, version)
    }

    pub async fn dispatch(
        &self,
        side: Side,
        entity: &Entity,
    ) -> Result<Option<mirror_sync::Outcome>, mirror_sync::SyncError> {
        self.dispatcher.dispatch(&Event::added(entity.to_ref(side))).await
    }
}

/// Project `chr_show` / sequence `seq01` / shot `sh010`, plus the task and
/// asset types both servers define.
pub fn seed_layout(server: &MemoryServer) -> Layout {
    let project = server.seed(EntityKind::Project, fields([("name", json!(PROJECT))]));
    let sequence = server.seed(
        EntityKind::Context,
        fields([
            ("name", json!("seq01")),
            ("parent_id", json!(project.id.0)),
            ("project_id", json!(project.id.0)),
        ]),
    );
    let shot = server.seed(
        EntityKind::Shot,
        fields([
            ("name", json!("sh010")),
            ("parent_id", json!(sequence.id.0)),
            ("project_id", json!(project.id.0)),
        ]),
    );
    for name in ["Animation", "Lighting", "Compositing", "Generic"] {
        server.seed(EntityKind::TaskType, fields([("name", json!(name))]));
    }
    server.seed(EntityKind::AssetType, fields([("name", json!("Render"))]));
    Layout {
        project,
        sequence,
        shot,
    }
}

pub fn type_id(server: &MemoryServer, kind: EntityKind, name: &str) -> Value {
    server
        .entities(kind)
        .into_iter()
        .find(|t| t.name() == Some(name))
        .map(|t| json!(t.id.0))
        .unwrap_or(Value::Null)
}

/// Entities of `kind` on `server` named `name`.
pub fn named(server: &MemoryServer, kind: EntityKind, name: &str) -> Vec<Entity> {
    server
        .entities(kind)
        .into_iter()
        .filter(|e| e.name() == Some(name))
        .collect()
}
