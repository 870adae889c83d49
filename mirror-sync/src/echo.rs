//! Echo suppression.
//!
//! Every entity the engine writes is recorded here for a bounded time. An
//! inbound event whose `(server, kind, id)` is still recorded was caused by
//! our own write and must not be mirrored back.
//!
//! Lookups are non-consuming: one write can produce several events (create
//! plus an immediate index update), and all of them must be suppressed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use mirror_core::{EntityId, EntityKind, EntityRef, Side};

/// Above this many entries, `record` also drops expired ones.
const INLINE_SWEEP_THRESHOLD: usize = 512;

type EchoKey = (Side, EntityKind, EntityId);

#[derive(Debug)]
pub struct EchoSuppressor {
    ttl: Duration,
    entries: Mutex<HashMap<EchoKey, Instant>>,
}

impl EchoSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mark `id` on `server` as self-caused for the next `ttl`. Re-recording
    /// refreshes the expiry.
    pub fn record(&self, server: Side, kind: EntityKind, id: &EntityId) {
        let now = Instant::now();
        let mut entries = self.lock();
        if entries.len() >= INLINE_SWEEP_THRESHOLD {
            entries.retain(|_, expires_at| *expires_at > now);
        }
        entries.insert((server, kind, id.clone()), now + self.ttl);
        tracing::trace!(server = %server, kind = %kind, id = %id, "echo recorded");
    }

    pub fn record_ref(&self, entity: &EntityRef) {
        self.record(entity.side, entity.kind, &entity.id);
    }

    /// True iff an unexpired entry exists. Never mutates.
    pub fn is_echo(&self, server: Side, kind: EntityKind, id: &EntityId) -> bool {
        let now = Instant::now();
        self.lock()
            .get(&(server, kind, id.clone()))
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub fn is_echo_ref(&self, entity: &EntityRef) -> bool {
        self.is_echo(entity.side, entity.kind, &entity.id)
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EchoKey, Instant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
