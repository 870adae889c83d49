//! trackmirror core library: domain types, configuration, the remote
//! adapter seam, and an in-process tracking service.
//!
//! - [`types`]: ids, sides, entities, events, filters
//! - [`error`]: [`ConfigError`], [`RemoteError`]
//! - [`config`]: YAML config loading, credential resolution
//! - [`adapter`]: [`RemoteAdapter`] trait and [`Servers`] pairing
//! - [`memory`]: [`MemoryServer`], an in-memory adapter
//! - [`retry`]: bounded retry with backoff

pub mod adapter;
pub mod config;
pub mod error;
pub mod memory;
pub mod retry;
pub mod types;

pub use adapter::{RemoteAdapter, ServerRef, Servers};
pub use config::{MirrorConfig, SyncSettings};
pub use error::{ConfigError, RemoteError};
pub use memory::MemoryServer;
pub use retry::RetryPolicy;
pub use types::{
    fields, Action, Direction, Entity, EntityId, EntityKind, EntityRef, Event, Fields, Filter,
    Side,
};
