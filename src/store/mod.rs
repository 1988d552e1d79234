use std::collections::BTreeMap;
use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{EntitySnapshotEnvelope, EventEnvelope, StreamEnvelope};
use crate::error::AdapterError;
use crate::event::{Entity, Event, ReadModel};
use crate::types::{EntityId, ReadModelId, SequenceKey};

pub mod memory;

/// An `EventStoreAdapter` is responsible for persisting event envelopes and entity snapshots, and
/// for loading the part of an entity stream that is newer than a given cursor.
#[async_trait]
pub trait EventStoreAdapter<E, S>: Send + Sync
where
    E: Event,
    S: Entity,
{
    /// Loads the most recent snapshot stored for the given entity.
    async fn latest_entity_snapshot(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<Option<EntitySnapshotEnvelope<S>>, AdapterError>;

    /// Loads everything recorded in the stream of the given entity strictly after `since`,
    /// ordered by `created_at`. The stream might contain snapshots as well.
    async fn for_entity_since(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StreamEnvelope<E, S>>, AdapterError>;

    /// Persists a snapshot, returning it as stored.
    async fn store_snapshot(&self, snapshot: EntitySnapshotEnvelope<S>) -> Result<EntitySnapshotEnvelope<S>, AdapterError>;

    /// Persists event envelopes, returning them as stored.
    async fn store(&self, envelopes: Vec<EventEnvelope<E, S>>) -> Result<Vec<EventEnvelope<E, S>>, AdapterError>;
}

/// Blanket implementation making an [`EventStoreAdapter`] every (smart) pointer to an
/// [`EventStoreAdapter`], e.g. `&Store`, `Box<Store>`, `Arc<Store>`.
#[async_trait]
impl<E, S, A, T> EventStoreAdapter<E, S> for T
where
    E: Event,
    S: Entity,
    A: EventStoreAdapter<E, S> + ?Sized,
    T: Deref<Target = A> + Send + Sync,
{
    async fn latest_entity_snapshot(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<Option<EntitySnapshotEnvelope<S>>, AdapterError> {
        self.deref().latest_entity_snapshot(entity_type_name, entity_id).await
    }

    async fn for_entity_since(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StreamEnvelope<E, S>>, AdapterError> {
        self.deref().for_entity_since(entity_type_name, entity_id, since).await
    }

    async fn store_snapshot(&self, snapshot: EntitySnapshotEnvelope<S>) -> Result<EntitySnapshotEnvelope<S>, AdapterError> {
        self.deref().store_snapshot(snapshot).await
    }

    async fn store(&self, envelopes: Vec<EventEnvelope<E, S>>) -> Result<Vec<EventEnvelope<E, S>>, AdapterError> {
        self.deref().store(envelopes).await
    }
}

/// Converts the payload a transport delivers (a database stream record batch, a message
/// queue batch...) into envelopes.
pub trait RawEventsDecoder<E, S>: Send + Sync
where
    E: Event,
    S: Entity,
{
    type Raw: Send;

    fn raw_to_envelopes(&self, raw: Self::Raw) -> Result<Vec<StreamEnvelope<E, S>>, AdapterError>;
}

/// Decodes a JSON array of envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventsDecoder;

impl<E, S> RawEventsDecoder<E, S> for JsonEventsDecoder
where
    E: Event,
    S: Entity,
{
    type Raw = Value;

    fn raw_to_envelopes(&self, raw: Value) -> Result<Vec<StreamEnvelope<E, S>>, AdapterError> {
        Ok(serde_json::from_value(raw)?)
    }
}

/// The metadata the projection engine keeps on every read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelMetadata {
    /// Optimistic concurrency token, incremented on every store.
    pub version: u64,
    pub schema_version: u32,
    pub last_update_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_projection_info: Option<LastProjectionInfo>,
}

/// Which entity change produced the current value of a read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastProjectionInfo {
    pub entity_id: EntityId,
    pub entity_name: String,
    pub entity_updated_at: DateTime<Utc>,
    pub projection_method: String,
}

/// A read model as persisted by a [`ReadModelStoreAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelRecord<R> {
    pub id: ReadModelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_key: Option<SequenceKey>,
    pub value: R,
    pub metadata: ReadModelMetadata,
}

impl<R> ReadModelRecord<R> {
    pub fn version(&self) -> u64 {
        self.metadata.version
    }
}

/// Field equality filter used by [`ReadModelStoreAdapter::search`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadModelFilter {
    pub equals: BTreeMap<String, Value>,
    pub limit: Option<usize>,
}

impl ReadModelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A `ReadModelStoreAdapter` persists read models, guarding every write with an optimistic
/// concurrency check on [`ReadModelMetadata::version`].
#[async_trait]
pub trait ReadModelStoreAdapter<R>: Send + Sync
where
    R: ReadModel,
{
    /// Loads the read models with the given id. When a sequence key is given only the record
    /// with that sequence key is returned. `None` means nothing was found.
    async fn fetch(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<Option<Vec<ReadModelRecord<R>>>, AdapterError>;

    async fn search(&self, read_model_name: &str, filter: &ReadModelFilter) -> Result<Vec<ReadModelRecord<R>>, AdapterError>;

    /// Persists the record if the stored version equals `expected_version` (0 for a read model
    /// that doesn't exist yet).
    ///
    /// # Errors
    ///
    /// Must return [`AdapterError::VersionConflict`] if the stored version differs.
    async fn store(
        &self,
        read_model_name: &str,
        record: ReadModelRecord<R>,
        expected_version: u64,
    ) -> Result<ReadModelRecord<R>, AdapterError>;

    /// Deletes the read model. Deleting a read model that doesn't exist is not an error.
    async fn delete(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<(), AdapterError>;
}

/// Blanket implementation making a [`ReadModelStoreAdapter`] every (smart) pointer to a
/// [`ReadModelStoreAdapter`].
#[async_trait]
impl<R, A, T> ReadModelStoreAdapter<R> for T
where
    R: ReadModel,
    A: ReadModelStoreAdapter<R> + ?Sized,
    T: Deref<Target = A> + Send + Sync,
{
    async fn fetch(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<Option<Vec<ReadModelRecord<R>>>, AdapterError> {
        self.deref().fetch(read_model_name, id, sequence_key).await
    }

    async fn search(&self, read_model_name: &str, filter: &ReadModelFilter) -> Result<Vec<ReadModelRecord<R>>, AdapterError> {
        self.deref().search(read_model_name, filter).await
    }

    async fn store(
        &self,
        read_model_name: &str,
        record: ReadModelRecord<R>,
        expected_version: u64,
    ) -> Result<ReadModelRecord<R>, AdapterError> {
        self.deref().store(read_model_name, record, expected_version).await
    }

    async fn delete(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<(), AdapterError> {
        self.deref().delete(read_model_name, id, sequence_key).await
    }
}
