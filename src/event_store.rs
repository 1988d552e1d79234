use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::action::Action;
use crate::config::{Config, Domain};
use crate::envelope::{EntitySnapshotEnvelope, EventEnvelope, EventValue, StreamEnvelope, ENVELOPE_VERSION};
use crate::error::EventStoreError;
use crate::event::Entity;
use crate::store::EventStoreAdapter;
use crate::time::{epoch, next_timestamp};
use crate::types::{EntityId, SuperKind};

/// Outcome of [`EventStore::fetch_entity_snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLookup<S> {
    /// The up to date snapshot of the entity.
    Current(EntitySnapshotEnvelope<S>),
    /// The entity has neither a snapshot nor events.
    NotFound,
    /// The entity was reconstructed but the snapshot could not be persisted. This says nothing
    /// about the existence of the entity: try again later.
    Unavailable,
}

impl<S> SnapshotLookup<S> {
    pub fn current(&self) -> Option<&EntitySnapshotEnvelope<S>> {
        match self {
            Self::Current(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn into_current(self) -> Option<EntitySnapshotEnvelope<S>> {
        match self {
            Self::Current(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Outcome of folding a single event into a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduced<S> {
    Updated(EntitySnapshotEnvelope<S>),
    /// The stream continues as another entity: the snapshot carries the new type and identity.
    Migrated {
        from_entity_type_name: String,
        snapshot: EntitySnapshotEnvelope<S>,
    },
    /// The event left the snapshot untouched.
    Skipped,
}

impl<S> Reduced<S> {
    pub fn into_snapshot(self) -> Option<EntitySnapshotEnvelope<S>> {
        match self {
            Self::Updated(snapshot) | Self::Migrated { snapshot, .. } => Some(snapshot),
            Self::Skipped => None,
        }
    }
}

/// Reconstructs entities by folding their pending events into their latest snapshot.
pub struct EventStore<D: Domain> {
    config: Arc<Config<D>>,
    adapter: Arc<dyn EventStoreAdapter<D::Event, D::Entity>>,
}

impl<D: Domain> Clone for EventStore<D> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<D: Domain> EventStore<D> {
    pub fn new(config: Arc<Config<D>>, adapter: impl EventStoreAdapter<D::Event, D::Entity> + 'static) -> Self {
        Self {
            config,
            adapter: Arc::new(adapter),
        }
    }

    pub fn config(&self) -> &Config<D> {
        &self.config
    }

    pub fn adapter(&self) -> &dyn EventStoreAdapter<D::Event, D::Entity> {
        self.adapter.as_ref()
    }

    /// Loads the latest snapshot of the given entity and folds into it every event recorded after
    /// it, in order. If anything was folded the new snapshot is persisted and the stored version
    /// is returned.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if an event has no registered reducer, if a reducer fails, or if the
    /// snapshot or the events can't be loaded. In all these cases nothing is persisted.
    #[tracing::instrument(skip_all, fields(entity_type_name = %entity_type_name, entity_id = %entity_id), err)]
    pub async fn fetch_entity_snapshot(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<SnapshotLookup<D::Entity>, EventStoreError> {
        let latest: Option<EntitySnapshotEnvelope<D::Entity>> =
            self.adapter.latest_entity_snapshot(entity_type_name, entity_id).await?;
        let since: DateTime<Utc> = latest
            .as_ref()
            .map_or_else(epoch, |snapshot| snapshot.snapshotted_event_created_at);

        let pending: Vec<StreamEnvelope<D::Event, D::Entity>> =
            self.adapter.for_entity_since(entity_type_name, entity_id, since).await?;

        let mut events: Vec<EventEnvelope<D::Event, D::Entity>> = pending
            .into_iter()
            .filter_map(|envelope| match envelope {
                StreamEnvelope::Event(event) => Some(event),
                StreamEnvelope::Snapshot(_) => {
                    tracing::debug!("skipping snapshot found among pending events");
                    None
                }
            })
            .collect();

        let mut current: Option<EntitySnapshotEnvelope<D::Entity>> = latest;

        if let Some(migrated) = self.migrated_snapshot(&events).await? {
            let cursor: DateTime<Utc> = migrated.snapshotted_event_created_at;
            events.retain(|event| event.created_at > cursor);
            current = Some(migrated);
        }

        let mut folded: usize = 0;

        for event in events {
            match self.entity_reducer(&event, current.as_ref())? {
                Reduced::Updated(snapshot) => current = Some(snapshot),
                Reduced::Migrated {
                    from_entity_type_name,
                    snapshot,
                } => {
                    tracing::debug!({
                        from = %from_entity_type_name,
                        to = %snapshot.entity_type_name,
                        new_entity_id = %snapshot.entity_id,
                    }, "entity migrated");
                    current = Some(snapshot);
                }
                Reduced::Skipped => continue,
            }

            folded += 1;
        }

        let snapshot: EntitySnapshotEnvelope<D::Entity> = match current {
            None => return Ok(SnapshotLookup::NotFound),
            Some(snapshot) if folded == 0 => return Ok(SnapshotLookup::Current(snapshot)),
            Some(snapshot) => snapshot,
        };

        match self.adapter.store_snapshot(snapshot).await {
            Ok(stored) => Ok(SnapshotLookup::Current(stored)),
            Err(error) => {
                tracing::error!({
                    entity_type_name = %entity_type_name,
                    entity_id = %entity_id,
                    error = ?error,
                }, "failed to persist entity snapshot");

                Ok(SnapshotLookup::Unavailable)
            }
        }
    }

    /// The snapshot of a migrated entity lives under its new key, so the origin stream never
    /// sees its cursor move past the migration. Returns the snapshot stored under the new key if
    /// it already covers the last migration found in `events`.
    async fn migrated_snapshot(
        &self,
        events: &[EventEnvelope<D::Event, D::Entity>],
    ) -> Result<Option<EntitySnapshotEnvelope<D::Entity>>, EventStoreError> {
        let last_migration = events.iter().rev().find_map(|event| match &event.value {
            EventValue::EntityMigrated(migration) => Some((event.created_at, migration)),
            _ => None,
        });

        let (migrated_at, migration) = match last_migration {
            Some(found) => found,
            None => return Ok(None),
        };

        let snapshot: Option<EntitySnapshotEnvelope<D::Entity>> = self
            .adapter
            .latest_entity_snapshot(&migration.new_entity_name, &migration.new_entity.id())
            .await?;

        Ok(snapshot.filter(|snapshot| snapshot.snapshotted_event_created_at >= migrated_at))
    }

    /// Folds a single event into the given snapshot.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the event has no registered reducer or if the reducer fails.
    pub fn entity_reducer(
        &self,
        event: &EventEnvelope<D::Event, D::Entity>,
        current: Option<&EntitySnapshotEnvelope<D::Entity>>,
    ) -> Result<Reduced<D::Entity>, EventStoreError> {
        match &event.value {
            EventValue::EntityMigrated(migration) => Ok(Reduced::Migrated {
                from_entity_type_name: migration.old_entity_name.clone(),
                snapshot: EntitySnapshotEnvelope {
                    version: ENVELOPE_VERSION,
                    super_kind: SuperKind::FrameworkInternal,
                    entity_id: migration.new_entity.id(),
                    entity_type_name: migration.new_entity_name.clone(),
                    type_name: migration.new_entity_name.clone(),
                    value: migration.new_entity.clone(),
                    request_id: event.request_id,
                    current_user: event.current_user.clone(),
                    created_at: next_timestamp(),
                    snapshotted_event_created_at: event.created_at,
                    persisted_at: None,
                    deleted_at: None,
                },
            }),
            EventValue::EntityTouched(_) => Ok(match current {
                Some(current) => Reduced::Updated(EntitySnapshotEnvelope {
                    super_kind: SuperKind::FrameworkInternal,
                    request_id: event.request_id,
                    created_at: next_timestamp(),
                    snapshotted_event_created_at: event.created_at,
                    persisted_at: None,
                    ..current.clone()
                }),
                None => Reduced::Skipped,
            }),
            EventValue::Domain(domain_event) => self.reduce_domain_event(event, domain_event, current),
        }
    }

    fn reduce_domain_event(
        &self,
        event: &EventEnvelope<D::Event, D::Entity>,
        domain_event: &D::Event,
        current: Option<&EntitySnapshotEnvelope<D::Entity>>,
    ) -> Result<Reduced<D::Entity>, EventStoreError> {
        let reducer = self
            .config
            .registry()
            .reducer(&event.type_name)
            .ok_or_else(|| EventStoreError::MissingReducer(event.type_name.clone()))?;

        let span = tracing::trace_span!(
            "evolve.reducer",
            event_type_name = %event.type_name,
            entity_id = %event.entity_id,
            reducer = %reducer.qualified_name(),
        );
        let _e = span.enter();

        // A deleted entity is recreated from scratch by the next event.
        let current: Option<&EntitySnapshotEnvelope<D::Entity>> = current.filter(|snapshot| !snapshot.is_deleted());

        let action: Action<D::Entity> =
            reducer
                .reduce(domain_event, current.map(|snapshot| &snapshot.value))
                .map_err(|source| EventStoreError::Reducer {
                    event_type_name: event.type_name.clone(),
                    entity_type_name: reducer.entity_type_name().to_string(),
                    entity_id: event.entity_id.clone(),
                    method: reducer.qualified_name(),
                    source,
                })?;

        let entity_id: EntityId = current.map_or_else(|| event.entity_id.clone(), |snapshot| snapshot.entity_id.clone());

        let (value, deleted_at): (D::Entity, Option<DateTime<Utc>>) = match action {
            Action::Value(value) => (value, None),
            Action::Skip => return Ok(Reduced::Skipped),
            Action::Delete => match current {
                Some(snapshot) => (snapshot.value.clone(), Some(event.created_at)),
                None => return Ok(Reduced::Skipped),
            },
        };

        Ok(Reduced::Updated(EntitySnapshotEnvelope {
            version: ENVELOPE_VERSION,
            super_kind: event.super_kind,
            entity_id,
            entity_type_name: reducer.entity_type_name().to_string(),
            type_name: reducer.entity_type_name().to_string(),
            value,
            request_id: event.request_id,
            current_user: event.current_user.clone(),
            created_at: next_timestamp(),
            snapshotted_event_created_at: event.created_at,
            persisted_at: None,
            deleted_at,
        }))
    }

    /// Persists new events.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the adapter fails to store the events.
    #[tracing::instrument(skip_all, fields(events = envelopes.len()), err)]
    pub async fn store_events(
        &self,
        envelopes: Vec<EventEnvelope<D::Event, D::Entity>>,
    ) -> Result<Vec<EventEnvelope<D::Event, D::Entity>>, EventStoreError> {
        let stored = self.adapter.store(envelopes).await?;
        tracing::debug!(stored = stored.len(), "events stored");

        Ok(stored)
    }
}
