//! # mirror-sync
//!
//! The bidirectional mirroring engine.
//!
//! A [`Dispatcher`] subscribes to both servers and routes each `add` event to
//! the handler for its entity type. Handlers resolve the destination context
//! by business key through a [`Resolver`], create what is missing, and
//! record every write with the [`EchoSuppressor`] so the event it causes on
//! the far side is not mirrored back.

pub mod dispatcher;
pub mod echo;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod locks;
pub mod resolver;
pub mod stats;

pub use dispatcher::Dispatcher;
pub use echo::EchoSuppressor;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use handlers::{HandlerKind, Outcome, SkipReason, SyncHandler};
pub use locks::{KeyLocks, LockKey};
pub use resolver::{DestinationContext, Resolver, SourceLineage};
pub use stats::{CounterSnapshot, SyncStats};
