use std::sync::Arc;

use tracing::Instrument;

use crate::bus::{EventStreamProducer, InMemoryEventStreamConsumer};
use crate::config::{Config, Domain};
use crate::envelope::{EventEnvelope, StreamEnvelope};
use crate::error::{DispatchError, ProcessingError};
use crate::event_store::{EventStore, SnapshotLookup};
use crate::parser::{stream_per_entity_events, EntityGroup};
use crate::read_model_store::ReadModelStore;
use crate::store::{EventStoreAdapter, RawEventsDecoder, ReadModelStoreAdapter};

/// Wires the event store and the read model store together: every entity touched by a batch of
/// events is reconstructed, projected, and its events are handed to the registered event
/// handlers.
pub struct EventDispatcher<D: Domain> {
    config: Arc<Config<D>>,
    event_store: EventStore<D>,
    read_model_store: ReadModelStore<D>,
}

impl<D: Domain> Clone for EventDispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            event_store: self.event_store.clone(),
            read_model_store: self.read_model_store.clone(),
        }
    }
}

impl<D: Domain> EventDispatcher<D> {
    pub fn new(
        config: Arc<Config<D>>,
        event_store_adapter: impl EventStoreAdapter<D::Event, D::Entity> + 'static,
        read_model_store_adapter: impl ReadModelStoreAdapter<D::ReadModel> + 'static,
    ) -> Self {
        Self {
            event_store: EventStore::new(Arc::clone(&config), event_store_adapter),
            read_model_store: ReadModelStore::new(Arc::clone(&config), read_model_store_adapter),
            config,
        }
    }

    pub fn event_store(&self) -> &EventStore<D> {
        &self.event_store
    }

    pub fn read_model_store(&self) -> &ReadModelStore<D> {
        &self.read_model_store
    }

    /// Decodes a batch of raw provider events and processes every entity it touches.
    ///
    /// # Errors
    ///
    /// Will return an `Err` only if the batch can't be decoded. Failures processing a single
    /// entity are logged and don't affect the other entities.
    #[tracing::instrument(skip_all, err)]
    pub async fn dispatch<Dec>(&self, decoder: &Dec, raw: Dec::Raw) -> Result<(), DispatchError>
    where
        Dec: RawEventsDecoder<D::Event, D::Entity>,
    {
        let envelopes = decoder.raw_to_envelopes(raw).map_err(DispatchError::Decode)?;
        self.dispatch_envelopes(envelopes).await;

        Ok(())
    }

    /// Processes every entity touched by the given envelopes. Returns the number of entities whose
    /// processing failed.
    pub async fn dispatch_envelopes(&self, envelopes: Vec<StreamEnvelope<D::Event, D::Entity>>) -> usize {
        stream_per_entity_events(self.config.as_ref(), envelopes, |group, _| self.process_entity(group)).await
    }

    /// Reconstructs the entity of the group, projects it and runs the event handlers of its events.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the entity can't be reconstructed or projected. Event handler
    /// failures are only logged.
    pub async fn process_entity(&self, group: EntityGroup<D::Event, D::Entity>) -> Result<(), ProcessingError> {
        let lookup = self
            .event_store
            .fetch_entity_snapshot(&group.entity_type_name, &group.entity_id)
            .await?;

        match lookup {
            SnapshotLookup::Current(snapshot) => self.read_model_store.project(&snapshot).await?,
            SnapshotLookup::NotFound => tracing::debug!("no snapshot to project"),
            SnapshotLookup::Unavailable => tracing::warn!({
                entity_type_name = %group.entity_type_name,
                entity_id = %group.entity_id,
            }, "snapshot unavailable, projection postponed"),
        }

        for event in group.events.iter().filter(|event| event.domain_event().is_some()) {
            self.handle_event(event).await;
        }

        Ok(())
    }

    async fn handle_event(&self, event: &EventEnvelope<D::Event, D::Entity>) {
        for event_handler in self.config.registry().event_handlers_for(&event.type_name) {
            let span = tracing::debug_span!(
                "evolve.event_handler",
                event_type_name = %event.type_name,
                entity_id = %event.entity_id,
                event_handler = event_handler.name(),
            );

            if let Err(error) = event_handler.handle(event).instrument(span).await {
                tracing::error!({
                    event_type_name = %event.type_name,
                    entity_id = %event.entity_id,
                    event_handler = event_handler.name(),
                    error = %error,
                }, "event handler failed to handle event");
            }
        }
    }

    /// Decodes a batch of raw provider events and publishes the events of each entity on the given
    /// producer, one batch per entity.
    ///
    /// # Errors
    ///
    /// Will return an `Err` only if the batch can't be decoded. Publishing failures are logged.
    #[tracing::instrument(skip_all, err)]
    pub async fn produce<Dec, P>(&self, decoder: &Dec, raw: Dec::Raw, producer: &P) -> Result<(), DispatchError>
    where
        Dec: RawEventsDecoder<D::Event, D::Entity>,
        P: EventStreamProducer<D::Event, D::Entity>,
    {
        let envelopes = decoder.raw_to_envelopes(raw).map_err(DispatchError::Decode)?;

        stream_per_entity_events(self.config.as_ref(), envelopes, |group, _| async move {
            producer
                .publish(group.events.into_iter().map(StreamEnvelope::Event).collect())
                .await
                .map_err(ProcessingError::Producer)
        })
        .await;

        Ok(())
    }

    /// Processes a batch received from an event stream.
    pub async fn consume(&self, envelopes: Vec<StreamEnvelope<D::Event, D::Entity>>) -> usize {
        self.dispatch_envelopes(envelopes).await
    }

    /// Consumes an in-process event stream until every producer is dropped.
    pub async fn consume_stream(&self, consumer: &mut InMemoryEventStreamConsumer<D::Event, D::Entity>) {
        while let Some(envelopes) = consumer.next_batch().await {
            let failures = self.consume(envelopes).await;

            if failures > 0 {
                tracing::warn!(failures = failures, "some entities of the consumed batch failed");
            }
        }
    }
}
