//! Event routing: entity kind → handler, with deadline and retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::Instrument;

use mirror_core::retry::retry;
use mirror_core::{Action, Direction, EntityKind, Event, RemoteError, Side};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::handlers::{default_handlers, HandlerKind, Outcome, SkipReason, SyncHandler};

pub struct Dispatcher {
    engine: Arc<SyncEngine>,
    handlers: HashMap<HandlerKind, Arc<dyn SyncHandler>>,
}

impl Dispatcher {
    /// Dispatcher with every standard handler registered.
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        default_handlers()
            .into_iter()
            .fold(Self::empty(engine), |d, handler| d.with_handler(handler))
    }

    /// Dispatcher with no handlers; every event is ignored until some are added.
    pub fn empty(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler`, replacing any handler of the same kind.
    pub fn with_handler(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Entity kinds with a registered handler, for subscriptions.
    pub fn subscribed_kinds(&self) -> Vec<EntityKind> {
        HandlerKind::ALL
            .iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .map(|kind| kind.entity_kind())
            .collect()
    }

    /// Handle one event to completion. Returns `Ok(None)` for events no
    /// handler is interested in (non-`add` actions, unrouted kinds).
    pub async fn dispatch(&self, event: &Event) -> Result<Option<Outcome>, SyncError> {
        if event.action != Action::Add {
            return Ok(None);
        }
        let Some(kind) = HandlerKind::for_entity(event.entity.kind) else {
            return Ok(None);
        };
        let Some(handler) = self.handlers.get(&kind) else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "dispatch",
            handler = %kind,
            direction = %Direction::from_source(event.side()),
            entity = %event.entity,
        );
        let result = self.run_handler(kind, handler.as_ref(), event).instrument(span).await;
        self.record(kind, event, &result);
        result.map(Some)
    }

    async fn run_handler(
        &self,
        kind: HandlerKind,
        handler: &dyn SyncHandler,
        event: &Event,
    ) -> Result<Outcome, SyncError> {
        let settings = self.engine.settings();
        let deadline = settings.handler_timeout();
        let stats = self.engine.stats();
        let label = format!("{kind} handler");

        retry(&settings.retry.policy(), &label, SyncError::is_transient, |attempt| {
            if attempt > 1 {
                stats.retried(kind);
            }
            let started = Instant::now();
            async move {
                match tokio::time::timeout(deadline, handler.handle(&self.engine, event)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        entity: event.entity.clone(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                }
            }
        })
        .await
    }

    fn record(&self, kind: HandlerKind, event: &Event, result: &Result<Outcome, SyncError>) {
        let stats = self.engine.stats();
        match result {
            Ok(Outcome::Applied { created }) => {
                stats.applied(kind);
                tracing::debug!(writes = created.len(), "event applied");
            }
            Ok(Outcome::Skipped(SkipReason::Echo)) => stats.suppressed(kind),
            Ok(Outcome::Skipped(reason)) => {
                stats.skipped(kind);
                tracing::debug!(%reason, "event skipped");
            }
            Err(err) => {
                stats.failed(kind);
                tracing::error!(
                    handler = %kind,
                    server = %event.side(),
                    kind = %event.entity.kind,
                    id = %event.entity.id,
                    error_kind = err.label(),
                    error = %err,
                    "failed to mirror event",
                );
            }
        }
    }

    /// Subscribe to both servers and handle events until `shutdown` fires.
    /// Every event runs in its own task; in-flight handlers are drained
    /// before returning.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), SyncError> {
        let kinds = self.subscribed_kinds();
        let mut undark = self.subscribe(Side::Undark, &kinds).await?;
        let mut pbv = self.subscribe(Side::Pbv, &kinds).await?;
        tracing::info!(kinds = ?kinds, "dispatcher listening on both servers");

        let mut in_flight = JoinSet::new();
        let (mut undark_open, mut pbv_open) = (true, true);

        while undark_open || pbv_open {
            let (side, event) = tokio::select! {
                _ = shutdown.recv() => break,
                event = undark.recv(), if undark_open => (Side::Undark, event),
                event = pbv.recv(), if pbv_open => (Side::Pbv, event),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "event task panicked");
                    }
                    continue;
                }
            };
            let Some(event) = event else {
                tracing::warn!(server = %side, "event stream closed");
                match side {
                    Side::Undark => undark_open = false,
                    Side::Pbv => pbv_open = false,
                }
                continue;
            };
            let dispatcher = self.clone();
            in_flight.spawn(async move {
                // Failures are logged and counted inside dispatch.
                let _ = dispatcher.dispatch(&event).await;
            });
        }

        let pending = in_flight.len();
        if pending > 0 {
            tracing::info!(pending, "draining in-flight events");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "event task panicked");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        side: Side,
        kinds: &[EntityKind],
    ) -> Result<mpsc::Receiver<Event>, RemoteError> {
        self.engine.server(side).api().subscribe(kinds).await
    }
}
