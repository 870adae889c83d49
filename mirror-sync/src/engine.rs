//! Shared state every handler works against.

use std::sync::Arc;

use mirror_core::{EntityRef, ServerRef, Servers, Side, SyncSettings};

use crate::echo::EchoSuppressor;
use crate::locks::KeyLocks;
use crate::resolver::Resolver;
use crate::stats::SyncStats;

/// Both servers plus the only cross-handler shared state: the echo
/// suppressor, the creation locks, and the counters.
#[derive(Debug)]
pub struct SyncEngine {
    servers: Servers,
    settings: SyncSettings,
    echo: Arc<EchoSuppressor>,
    locks: KeyLocks,
    stats: Arc<SyncStats>,
}

impl SyncEngine {
    pub fn new(servers: Servers, settings: SyncSettings) -> Self {
        let echo = Arc::new(EchoSuppressor::new(settings.echo_ttl()));
        Self {
            servers,
            settings,
            echo,
            locks: KeyLocks::new(),
            stats: Arc::new(SyncStats::new()),
        }
    }

    pub fn server(&self, side: Side) -> &ServerRef {
        self.servers.get(side)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn echo(&self) -> &Arc<EchoSuppressor> {
        &self.echo
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    /// Resolver writing to the side opposite `source`.
    pub fn resolver(&self, source: Side) -> Resolver<'_> {
        Resolver::new(self, source)
    }

    /// Remember a write the engine just made so its event is ignored.
    pub fn record_write(&self, entity: &EntityRef) {
        self.echo.record_ref(entity);
    }
}
