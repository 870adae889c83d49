//! Applied / suppressed / skipped / failed counters per handler.
//!
//! The suppressed-vs-applied ratio is the production signal for an echo TTL
//! that is too short: echoes arriving after expiry show up as extra applied
//! or skipped-as-already-mirrored events instead of suppressed ones.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::handlers::HandlerKind;

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    suppressed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of one handler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub applied: u64,
    pub suppressed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
pub struct SyncStats {
    counters: [Counters; HandlerKind::ALL.len()],
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self, kind: HandlerKind) {
        self.slot(kind).applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn suppressed(&self, kind: HandlerKind) {
        self.slot(kind).suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self, kind: HandlerKind) {
        self.slot(kind).skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, kind: HandlerKind) {
        self.slot(kind).failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self, kind: HandlerKind) {
        self.slot(kind).retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: HandlerKind) -> CounterSnapshot {
        let c = self.slot(kind);
        CounterSnapshot {
            applied: c.applied.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Counters keyed by handler name.
    pub fn snapshot(&self) -> BTreeMap<String, CounterSnapshot> {
        HandlerKind::ALL
            .iter()
            .map(|kind| (kind.to_string(), self.get(*kind)))
            .collect()
    }

    fn slot(&self, kind: HandlerKind) -> &Counters {
        &self.counters[kind.index()]
    }
}
