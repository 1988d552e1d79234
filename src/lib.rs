//! Event sourcing core: entities are reconstructed by folding their event streams into snapshots,
//! and entity snapshots are projected into read models.
//!
//! The crate doesn't talk to any database or broker: persistence is provided through the
//! [`store::EventStoreAdapter`] and [`store::ReadModelStoreAdapter`] traits, and in-memory
//! implementations of both are available in [`store::memory`].

pub use crate::action::Action;
pub use crate::config::{
    Backoff, Config, Domain, FixedBackoff, JitteredBackoff, NoBackoff, RetryPolicy, DEFAULT_MAX_ATTEMPTS,
};
pub use crate::dispatch::EventDispatcher;
pub use crate::event::{lookup_field, Entity, Event, ReadModel};
pub use crate::event_store::{EventStore, Reduced, SnapshotLookup};
pub use crate::handler::EventHandler;
pub use crate::read_model_store::ReadModelStore;
pub use crate::registry::{Registry, RegistryBuilder};
pub use crate::types::{BoxError, EntityId, ReadModelId, SequenceKey, SuperKind, UserEnvelope};

mod action;
pub mod bus;
mod config;
mod dispatch;
pub mod envelope;
pub mod error;
mod event;
mod event_store;
mod handler;
pub mod parser;
mod read_model_store;
pub mod registry;
pub mod store;
pub mod time;
mod types;
