use std::sync::{Arc, Mutex};

use serde_json::json;

use evolve::bus::in_memory_event_stream;
use evolve::envelope::{EventEnvelope, StreamEnvelope};
use evolve::error::DispatchError;
use evolve::parser::{stream_per_entity_events, EntityGroup};
use evolve::store::memory::PassThroughDecoder;
use evolve::store::{EventStoreAdapter, JsonEventsDecoder};
use evolve::{EntityId, EventDispatcher, ReadModelId};

use crate::fixtures::{
    cart_event, config, item_added, shop, FailingEventHandler, RecordingEventHandler, RecordingEventStore,
    RecordingReadModelStore, Shop, ShopEntity, ShopEvent, View,
};

struct Harness {
    dispatcher: EventDispatcher<Shop>,
    events: Arc<RecordingEventStore>,
    read_models: Arc<RecordingReadModelStore>,
}

fn harness(registry: evolve::RegistryBuilder<Shop>) -> Harness {
    let events = Arc::new(RecordingEventStore::default());
    let read_models = Arc::new(RecordingReadModelStore::default());
    let dispatcher = EventDispatcher::new(config(registry), Arc::clone(&events), Arc::clone(&read_models));

    Harness {
        dispatcher,
        events,
        read_models,
    }
}

impl Harness {
    /// Persists the events and returns them as the batch a stream would deliver.
    async fn record(&self, events: Vec<EventEnvelope<ShopEvent, ShopEntity>>) -> Vec<StreamEnvelope<ShopEvent, ShopEntity>> {
        self.events.store(events.clone()).await.unwrap();
        events.into_iter().map(StreamEnvelope::Event).collect()
    }

    async fn summary(&self, cart_id: &str) -> Option<View> {
        self.dispatcher
            .read_model_store()
            .fetch_read_model("CartSummary", &ReadModelId::new(cart_id), None)
            .await
            .unwrap()
    }
}

fn corrupted(cart_id: &str) -> EventEnvelope<ShopEvent, ShopEntity> {
    cart_event(
        cart_id,
        ShopEvent::CartCorrupted {
            cart_id: cart_id.to_string(),
        },
    )
}

#[tokio::test]
async fn failing_entity_does_not_abort_the_batch() {
    let harness = harness(shop());
    let batch = harness
        .record(vec![item_added("a", 1), item_added("b", 2), corrupted("a"), item_added("b", 3)])
        .await;

    harness
        .dispatcher
        .dispatch(&PassThroughDecoder::default(), batch)
        .await
        .unwrap();

    assert_eq!(harness.summary("a").await, None);
    assert_eq!(
        harness.summary("b").await,
        Some(View {
            id: "b".to_string(),
            count: 5
        })
    );
}

#[tokio::test]
async fn failures_are_counted_per_entity() {
    let harness = harness(shop());
    let batch = harness
        .record(vec![corrupted("a"), item_added("b", 1), corrupted("c")])
        .await;

    assert_eq!(harness.dispatcher.dispatch_envelopes(batch).await, 2);
}

#[tokio::test]
async fn callback_runs_once_per_group_in_order() {
    let config = config(shop());
    let a1 = item_added("a", 1);
    let b1 = item_added("b", 1);
    let a2 = item_added("a", 2);
    let b2 = item_added("b", 2);
    let batch: Vec<StreamEnvelope<ShopEvent, ShopEntity>> = vec![a1.into(), b1.clone().into(), a2.into(), b2.clone().into()];

    let seen: Arc<Mutex<Vec<EntityGroup<ShopEvent, ShopEntity>>>> = Arc::new(Mutex::new(vec![]));

    let failures = stream_per_entity_events(config.as_ref(), batch, |group, _| {
        let seen = Arc::clone(&seen);
        async move {
            if group.entity_id == EntityId::new("a") {
                return Err("group a is broken");
            }

            seen.lock().unwrap().push(group);
            Ok(())
        }
    })
    .await;

    assert_eq!(failures, 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].entity_type_name, "Cart");
    assert_eq!(seen[0].entity_id, EntityId::new("b"));
    assert_eq!(seen[0].events, vec![b1, b2]);
}

#[tokio::test]
async fn event_handlers_see_domain_events_after_projection() {
    let recorder = RecordingEventHandler::default();
    let harness = harness(
        shop()
            .event_handler("ItemAdded", FailingEventHandler)
            .event_handler("ItemAdded", recorder.clone()),
    );

    let touch = EventEnvelope::entity_touched("Cart", EntityId::new("1"), uuid::Uuid::new_v4());
    let batch = harness
        .record(vec![item_added("1", 1), item_added("1", 2), touch])
        .await;

    harness.dispatcher.dispatch_envelopes(batch).await;

    let handled = recorder.handled.lock().unwrap().clone();
    assert_eq!(
        handled,
        vec![
            (EntityId::new("1"), "ItemAdded".to_string()),
            (EntityId::new("1"), "ItemAdded".to_string()),
        ]
    );
    assert_eq!(harness.summary("1").await.map(|view| view.count), Some(3));
}

#[tokio::test]
async fn undecodable_batch_is_rejected() {
    let harness = harness(shop());

    let result = harness
        .dispatcher
        .dispatch(&JsonEventsDecoder, json!({ "not": "a batch" }))
        .await;

    assert!(matches!(result, Err(DispatchError::Decode(_))));
    assert_eq!(harness.read_models.total_calls(), 0);
}

#[tokio::test]
async fn produced_batches_are_consumed_per_entity() {
    let harness = harness(shop());
    let batch = harness
        .record(vec![item_added("1", 1), item_added("2", 5), item_added("1", 1)])
        .await;
    let raw = serde_json::to_value(&batch).unwrap();

    let (stream, mut consumer) = in_memory_event_stream(8);
    harness
        .dispatcher
        .produce(&JsonEventsDecoder, raw, &stream)
        .await
        .unwrap();
    drop(stream);

    let mut batches: Vec<Vec<StreamEnvelope<ShopEvent, ShopEntity>>> = vec![];
    while let Some(batch) = consumer.try_next_batch() {
        batches.push(batch);
    }

    let mut sizes: Vec<(String, usize)> = batches
        .iter()
        .map(|batch| (batch[0].entity_id().to_string(), batch.len()))
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![("1".to_string(), 2), ("2".to_string(), 1)]);
    assert!(batches.iter().flatten().all(StreamEnvelope::is_event));

    let (stream, mut consumer) = in_memory_event_stream(8);
    for batch in batches {
        evolve::bus::EventStreamProducer::publish(&stream, batch).await.unwrap();
    }
    drop(stream);

    harness.dispatcher.consume_stream(&mut consumer).await;

    assert_eq!(harness.summary("1").await.map(|view| view.count), Some(2));
    assert_eq!(harness.summary("2").await.map(|view| view.count), Some(5));
}
