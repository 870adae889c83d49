//! Uniform access to one tracking-service instance.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ConfigError, RemoteError};
use crate::types::{Entity, EntityId, EntityKind, Event, Fields, Filter, Side};

/// Query/create/update plus event subscription over one server.
///
/// Every method may suspend on network I/O. Implementations must be safe to
/// call from many tasks at once.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Server this adapter talks to.
    fn side(&self) -> Side;

    async fn query(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>, RemoteError>;

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<Entity, RemoteError>;

    /// Create several entities in a single commit: all or nothing.
    async fn create_batch(
        &self,
        kind: EntityKind,
        batch: Vec<Fields>,
    ) -> Result<Vec<Entity>, RemoteError>;

    async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        fields: Fields,
    ) -> Result<Entity, RemoteError>;

    /// Stream of events for the given kinds. The stream ends when the
    /// adapter shuts down or the receiver is dropped.
    async fn subscribe(&self, kinds: &[EntityKind]) -> Result<mpsc::Receiver<Event>, RemoteError>;

    async fn first(
        &self,
        kind: EntityKind,
        filter: &Filter,
    ) -> Result<Option<Entity>, RemoteError> {
        Ok(self.query(kind, filter).await?.into_iter().next())
    }

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>, RemoteError> {
        self.first(kind, &Filter::by_id(id)).await
    }
}

/// Handle on one server: its side plus its adapter.
#[derive(Clone)]
pub struct ServerRef {
    side: Side,
    adapter: Arc<dyn RemoteAdapter>,
}

impl ServerRef {
    pub fn new(adapter: Arc<dyn RemoteAdapter>) -> Self {
        Self {
            side: adapter.side(),
            adapter,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn api(&self) -> &dyn RemoteAdapter {
        self.adapter.as_ref()
    }
}

impl fmt::Debug for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRef").field("side", &self.side).finish()
    }
}

/// Both servers, addressable by side.
#[derive(Debug, Clone)]
pub struct Servers {
    undark: ServerRef,
    pbv: ServerRef,
}

impl Servers {
    /// Pair two adapters, placing each by the side it reports.
    pub fn new(a: Arc<dyn RemoteAdapter>, b: Arc<dyn RemoteAdapter>) -> Result<Self, ConfigError> {
        let (a, b) = (ServerRef::new(a), ServerRef::new(b));
        match (a.side(), b.side()) {
            (Side::Undark, Side::Pbv) => Ok(Self { undark: a, pbv: b }),
            (Side::Pbv, Side::Undark) => Ok(Self { undark: b, pbv: a }),
            (side, _) => Err(ConfigError::Invalid {
                key: "servers".to_string(),
                reason: format!("both adapters report side {side}"),
            }),
        }
    }

    pub fn get(&self, side: Side) -> &ServerRef {
        match side {
            Side::Undark => &self.undark,
            Side::Pbv => &self.pbv,
        }
    }
}
