use crate::types::{BoxError, EntityId, ReadModelId};

/// Error returned by event store and read model store adapters.
#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    /// The stored read model version does not match the expected one.
    #[error("version conflict on read model {read_model_name} `{read_model_id}`: expected version {expected}, found {actual}")]
    VersionConflict {
        read_model_name: String,
        read_model_id: ReadModelId,
        expected: u64,
        actual: u64,
    },
    /// Serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Any other backend failure.
    #[error(transparent)]
    Custom(BoxError),
}

impl AdapterError {
    pub fn custom(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Custom(Box::new(error))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Error raised while building a [`crate::registry::Registry`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("event type `{event_type_name}` has more than one reducer: {first} and {second}")]
    DuplicateReducer {
        event_type_name: String,
        first: String,
        second: String,
    },
    #[error("event type `{0}` is reserved for framework-internal events")]
    ReservedEventType(String),
    #[error("projection {method} is registered more than once for entity `{entity_type_name}`")]
    DuplicateProjection { entity_type_name: String, method: String },
    #[error("read model `{0}` has more than one sequence key")]
    DuplicateSequenceKey(String),
}

/// Error raised while reconstructing an entity.
#[derive(thiserror::Error, Debug)]
pub enum EventStoreError {
    /// No reducer is registered for the event type found in the stream.
    #[error("no reducer registered for event type `{0}`")]
    MissingReducer(String),
    /// A reducer failed: the replay cycle is aborted and nothing is persisted.
    #[error("reducer {method} failed folding `{event_type_name}` into {entity_type_name}#{entity_id}")]
    Reducer {
        event_type_name: String,
        entity_type_name: String,
        entity_id: EntityId,
        method: String,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Error raised while projecting an entity snapshot into read models.
#[derive(thiserror::Error, Debug)]
pub enum ReadModelStoreError {
    /// Every attempt of the optimistic concurrency loop hit a version conflict.
    #[error("read model {read_model_name} `{read_model_id}` still conflicting after {attempts} attempts")]
    RetriesExhausted {
        read_model_name: String,
        read_model_id: ReadModelId,
        attempts: u32,
        #[source]
        source: AdapterError,
    },
    /// A user projection failed.
    #[error("projection {method} failed for read model `{read_model_id}`")]
    Projection {
        method: String,
        read_model_id: ReadModelId,
        #[source]
        source: BoxError,
    },
    /// The join key of an entity resolved to something that can't be a read model id.
    #[error("join key of projection {method} resolved to an unsupported value: {value}")]
    InvalidJoinKey { method: String, value: serde_json::Value },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// One or more projections of a single entity change failed. The others went through.
    #[error("{} projection(s) failed for {entity_type_name}#{entity_id}", .failures.len())]
    Failed {
        entity_type_name: String,
        entity_id: EntityId,
        failures: Vec<ReadModelStoreError>,
    },
}

impl ReadModelStoreError {
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// Error raised while processing the events of a single entity in a dispatched batch. It is
/// logged, never returned by the dispatcher.
#[derive(thiserror::Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error(transparent)]
    ReadModelStore(#[from] ReadModelStoreError),
    #[error("event stream producer failed")]
    Producer(#[source] BoxError),
}

/// Error raised by the dispatch entry points before any entity is processed.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("raw events could not be decoded")]
    Decode(#[source] AdapterError),
}
