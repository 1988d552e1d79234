//! Splits a batch of envelopes into per-entity groups and processes the groups independently.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;

use tracing::Instrument;

use crate::config::{Config, Domain};
use crate::envelope::{EventEnvelope, StreamEnvelope};
use crate::types::EntityId;

/// The events of a batch that belong to a single entity, in batch order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGroup<E, S> {
    pub entity_type_name: String,
    pub entity_id: EntityId,
    pub events: Vec<EventEnvelope<E, S>>,
}

/// Groups the events of a batch by entity. Snapshots are dropped. Groups appear in the order
/// their first event appears in the batch, and each group keeps the batch order of its events.
pub fn group_per_entity<E, S>(envelopes: Vec<StreamEnvelope<E, S>>) -> Vec<EntityGroup<E, S>> {
    let mut groups: Vec<EntityGroup<E, S>> = vec![];
    let mut positions: HashMap<(String, EntityId), usize> = HashMap::new();

    for event in envelopes.into_iter().filter_map(StreamEnvelope::into_event) {
        let key = (event.entity_type_name.clone(), event.entity_id.clone());

        match positions.get(&key) {
            Some(&position) => groups[position].events.push(event),
            None => {
                positions.insert(key, groups.len());
                groups.push(EntityGroup {
                    entity_type_name: event.entity_type_name.clone(),
                    entity_id: event.entity_id.clone(),
                    events: vec![event],
                });
            }
        }
    }

    groups
}

/// Invokes `callback` once per entity group of the batch. Groups run concurrently and all of
/// them are awaited. A failing group is logged and never affects the others.
///
/// Returns the number of groups whose callback failed.
pub async fn stream_per_entity_events<'a, D, F, Fut, Er>(
    config: &'a Config<D>,
    envelopes: Vec<StreamEnvelope<D::Event, D::Entity>>,
    callback: F,
) -> usize
where
    D: Domain,
    F: Fn(EntityGroup<D::Event, D::Entity>, &'a Config<D>) -> Fut,
    Fut: Future<Output = Result<(), Er>>,
    Er: Display,
{
    let groups = group_per_entity(envelopes);
    tracing::debug!(groups = groups.len(), "dispatching entity groups");

    let runs = groups.into_iter().map(|group| {
        let entity_type_name: String = group.entity_type_name.clone();
        let entity_id: EntityId = group.entity_id.clone();
        let span = tracing::debug_span!(
            "evolve.entity_group",
            entity_type_name = %entity_type_name,
            entity_id = %entity_id,
            events = group.events.len(),
        );
        let run = callback(group, config);

        async move {
            match run.await {
                Ok(()) => true,
                Err(error) => {
                    tracing::error!({
                        entity_type_name = %entity_type_name,
                        entity_id = %entity_id,
                        error = %error,
                    }, "failed to process entity events");

                    false
                }
            }
        }
        .instrument(span)
    });

    futures::future::join_all(runs)
        .await
        .into_iter()
        .filter(|succeeded| !succeeded)
        .count()
}
