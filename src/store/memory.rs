use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::envelope::{EntitySnapshotEnvelope, EventEnvelope, StreamEnvelope};
use crate::error::AdapterError;
use crate::event::{lookup_field, Entity, Event, ReadModel};
use crate::store::{EventStoreAdapter, RawEventsDecoder, ReadModelFilter, ReadModelRecord, ReadModelStoreAdapter};
use crate::types::{EntityId, ReadModelId, SequenceKey};

type StreamKey = (String, EntityId);

/// Event store keeping everything in memory. Useful in tests and local development.
pub struct InMemoryEventStore<E, S> {
    events: RwLock<HashMap<StreamKey, Vec<EventEnvelope<E, S>>>>,
    snapshots: RwLock<HashMap<StreamKey, Vec<EntitySnapshotEnvelope<S>>>>,
}

impl<E, S> Default for InMemoryEventStore<E, S> {
    fn default() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl<E, S> InMemoryEventStore<E, S>
where
    E: Event,
    S: Entity,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event of the given entity stream, oldest first.
    pub async fn events(&self, entity_type_name: &str, entity_id: &EntityId) -> Vec<EventEnvelope<E, S>> {
        self.events
            .read()
            .await
            .get(&(entity_type_name.to_string(), entity_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Every snapshot stored for the given entity, in storing order.
    pub async fn snapshots(&self, entity_type_name: &str, entity_id: &EntityId) -> Vec<EntitySnapshotEnvelope<S>> {
        self.snapshots
            .read()
            .await
            .get(&(entity_type_name.to_string(), entity_id.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl<E, S> EventStoreAdapter<E, S> for InMemoryEventStore<E, S>
where
    E: Event,
    S: Entity,
{
    async fn latest_entity_snapshot(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<Option<EntitySnapshotEnvelope<S>>, AdapterError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&(entity_type_name.to_string(), entity_id.clone()))
            .and_then(|snapshots| snapshots.iter().max_by_key(|s| s.snapshotted_event_created_at))
            .cloned())
    }

    async fn for_entity_since(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StreamEnvelope<E, S>>, AdapterError> {
        let mut events: Vec<EventEnvelope<E, S>> = self
            .events(entity_type_name, entity_id)
            .await
            .into_iter()
            .filter(|event| event.created_at > since)
            .collect();

        events.sort_by_key(|event| event.created_at);

        Ok(events.into_iter().map(StreamEnvelope::Event).collect())
    }

    async fn store_snapshot(&self, mut snapshot: EntitySnapshotEnvelope<S>) -> Result<EntitySnapshotEnvelope<S>, AdapterError> {
        snapshot.persisted_at = Some(Utc::now());

        self.snapshots
            .write()
            .await
            .entry((snapshot.entity_type_name.clone(), snapshot.entity_id.clone()))
            .or_default()
            .push(snapshot.clone());

        Ok(snapshot)
    }

    async fn store(&self, envelopes: Vec<EventEnvelope<E, S>>) -> Result<Vec<EventEnvelope<E, S>>, AdapterError> {
        let mut events = self.events.write().await;

        for envelope in &envelopes {
            events
                .entry((envelope.entity_type_name.clone(), envelope.entity_id.clone()))
                .or_default()
                .push(envelope.clone());
        }

        Ok(envelopes)
    }
}

/// Hands already decoded envelopes through, e.g. the batches of an
/// [`crate::bus::InMemoryEventStream`].
#[derive(Debug)]
pub struct PassThroughDecoder<E, S>(PhantomData<fn() -> (E, S)>);

impl<E, S> Default for PassThroughDecoder<E, S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E, S> RawEventsDecoder<E, S> for PassThroughDecoder<E, S>
where
    E: Event,
    S: Entity,
{
    type Raw = Vec<StreamEnvelope<E, S>>;

    fn raw_to_envelopes(&self, raw: Self::Raw) -> Result<Vec<StreamEnvelope<E, S>>, AdapterError> {
        Ok(raw)
    }
}

/// Read model store keeping everything in memory, with the same optimistic concurrency check a
/// database backed store performs.
pub struct InMemoryReadModelStore<R> {
    records: RwLock<HashMap<String, Vec<ReadModelRecord<R>>>>,
}

impl<R> Default for InMemoryReadModelStore<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<R> InMemoryReadModelStore<R>
where
    R: ReadModel,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of the given read model, in insertion order.
    pub async fn all(&self, read_model_name: &str) -> Vec<ReadModelRecord<R>> {
        self.records
            .read()
            .await
            .get(read_model_name)
            .cloned()
            .unwrap_or_default()
    }
}

fn same_record<R>(record: &ReadModelRecord<R>, id: &ReadModelId, sequence_key: Option<&SequenceKey>) -> bool {
    &record.id == id && sequence_key.map_or(true, |key| record.sequence_key.as_ref() == Some(key))
}

#[async_trait]
impl<R> ReadModelStoreAdapter<R> for InMemoryReadModelStore<R>
where
    R: ReadModel,
{
    async fn fetch(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<Option<Vec<ReadModelRecord<R>>>, AdapterError> {
        let found: Vec<ReadModelRecord<R>> = self
            .all(read_model_name)
            .await
            .into_iter()
            .filter(|record| same_record(record, id, sequence_key))
            .collect();

        Ok((!found.is_empty()).then_some(found))
    }

    async fn search(&self, read_model_name: &str, filter: &ReadModelFilter) -> Result<Vec<ReadModelRecord<R>>, AdapterError> {
        let mut found: Vec<ReadModelRecord<R>> = vec![];

        for record in self.all(read_model_name).await {
            let value = serde_json::to_value(&record.value)?;
            let matches: bool = filter
                .equals
                .iter()
                .all(|(field, expected)| lookup_field(&value, field) == Some(expected));

            if matches {
                found.push(record);
            }

            if filter.limit.is_some_and(|limit| found.len() >= limit) {
                break;
            }
        }

        Ok(found)
    }

    async fn store(
        &self,
        read_model_name: &str,
        record: ReadModelRecord<R>,
        expected_version: u64,
    ) -> Result<ReadModelRecord<R>, AdapterError> {
        let mut records = self.records.write().await;
        let records: &mut Vec<ReadModelRecord<R>> = records.entry(read_model_name.to_string()).or_default();

        let position: Option<usize> = records
            .iter()
            .position(|stored| stored.id == record.id && stored.sequence_key == record.sequence_key);
        let actual: u64 = position.map_or(0, |index| records[index].version());

        if actual != expected_version {
            return Err(AdapterError::VersionConflict {
                read_model_name: read_model_name.to_string(),
                read_model_id: record.id,
                expected: expected_version,
                actual,
            });
        }

        match position {
            Some(index) => records[index] = record.clone(),
            None => records.push(record.clone()),
        }

        Ok(record)
    }

    async fn delete(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<(), AdapterError> {
        if let Some(records) = self.records.write().await.get_mut(read_model_name) {
            records.retain(|record| !same_record(record, id, sequence_key));
        }

        Ok(())
    }
}
