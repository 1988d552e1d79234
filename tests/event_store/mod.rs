use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use evolve::envelope::{EntityMigrated, EventEnvelope};
use evolve::error::EventStoreError;
use evolve::store::EventStoreAdapter;
use evolve::time::next_timestamp;
use evolve::{Action, EntityId, EventStore, SnapshotLookup, SuperKind};

use crate::fixtures::{
    add_item, cart_event, cart_snapshot, config, item_added, reducers, Cart, Order, RecordingEventStore, Shop,
    ShopEntity, ShopEvent,
};

fn event_store() -> (EventStore<Shop>, Arc<RecordingEventStore>) {
    let adapter = Arc::new(RecordingEventStore::default());
    (EventStore::new(config(reducers()), Arc::clone(&adapter)), adapter)
}

fn count_of(lookup: &SnapshotLookup<ShopEntity>) -> i64 {
    lookup.current().unwrap().value.cart().unwrap().count
}

#[tokio::test]
async fn cart_is_rebuilt_from_snapshot_and_pending_events() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&invocations);
    let registry = evolve::Registry::<Shop>::builder().reducer(
        "ItemAdded",
        "Cart",
        "addItem",
        move |event: &ShopEvent, current: Option<&ShopEntity>| {
            counted.fetch_add(1, Ordering::SeqCst);
            add_item(event, current)
        },
    );

    let adapter = Arc::new(RecordingEventStore::default());
    let store: EventStore<Shop> = EventStore::new(config(registry), Arc::clone(&adapter));

    let t0 = next_timestamp();
    adapter
        .inner
        .store_snapshot(cart_snapshot(
            Cart {
                id: "42".to_string(),
                ..Cart::default()
            },
            t0,
        ))
        .await
        .unwrap();

    let t1 = item_added("42", 1);
    let t2 = item_added("42", 2);
    store.store_events(vec![t1, t2.clone()]).await.unwrap();

    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("42")).await.unwrap();
    let snapshot = lookup.current().unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.value.cart().unwrap().count, 3);
    assert_eq!(snapshot.snapshotted_event_created_at, t2.created_at);
    assert!(snapshot.persisted_at.is_some());
    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn replay_without_new_events_writes_nothing() {
    let (store, adapter) = event_store();
    store
        .store_events(vec![item_added("1", 1), item_added("1", 1)])
        .await
        .unwrap();

    let first = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    let second = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(count_of(&second), 2);
    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fold_result_does_not_depend_on_pagination() {
    let deltas = [3, -1, 4, 1, -5, 9];

    let (all_at_once, _) = event_store();
    let (one_by_one, _) = event_store();
    let mut last = SnapshotLookup::NotFound;

    for delta in deltas {
        let event = item_added("7", delta);
        all_at_once.store_events(vec![event.clone()]).await.unwrap();
        one_by_one.store_events(vec![event]).await.unwrap();
        last = one_by_one.fetch_entity_snapshot("Cart", &EntityId::new("7")).await.unwrap();
    }

    let folded = all_at_once.fetch_entity_snapshot("Cart", &EntityId::new("7")).await.unwrap();

    assert_eq!(count_of(&folded), deltas.iter().sum::<i64>());
    assert_eq!(count_of(&folded), count_of(&last));
    assert_eq!(
        folded.current().unwrap().snapshotted_event_created_at,
        last.current().unwrap().snapshotted_event_created_at
    );
}

#[tokio::test]
async fn skipped_event_carries_state_forward() {
    let (store, _) = event_store();
    let viewed = cart_event(
        "1",
        ShopEvent::CartViewed {
            cart_id: "1".to_string(),
        },
    );
    store
        .store_events(vec![item_added("1", 2), viewed.clone(), item_added("1", 3)])
        .await
        .unwrap();

    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    assert_eq!(count_of(&lookup), 5);

    // A stream made of skipped events only has nothing to snapshot.
    let (store, adapter) = event_store();
    store.store_events(vec![cart_event("2", ShopEvent::CartViewed { cart_id: "2".to_string() })]).await.unwrap();

    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("2")).await.unwrap();
    assert_eq!(lookup, SnapshotLookup::NotFound);
    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_reducer_halts_replay() {
    let (store, adapter) = event_store();
    store
        .store_events(vec![
            item_added("1", 1),
            cart_event(
                "1",
                ShopEvent::CartCorrupted {
                    cart_id: "1".to_string(),
                },
            ),
            item_added("1", 1),
        ])
        .await
        .unwrap();

    let error = store
        .fetch_entity_snapshot("Cart", &EntityId::new("1"))
        .await
        .unwrap_err();

    match error {
        EventStoreError::Reducer {
            event_type_name,
            method,
            source,
            ..
        } => {
            assert_eq!(event_type_name, "CartCorrupted");
            assert_eq!(method, "Cart.corrupt");
            assert_eq!(source.to_string(), "corrupted cart");
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 0);
    assert!(adapter
        .latest_entity_snapshot("Cart", &EntityId::new("1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unregistered_event_type_fails_loudly() {
    let (store, adapter) = event_store();
    store
        .store_events(vec![
            item_added("1", 1),
            cart_event(
                "1",
                ShopEvent::CartRenamed {
                    cart_id: "1".to_string(),
                },
            ),
        ])
        .await
        .unwrap();

    let result = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await;

    assert!(matches!(result, Err(EventStoreError::MissingReducer(type_name)) if type_name == "CartRenamed"));
    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn snapshot_persistence_failure_is_not_fatal() {
    let (store, adapter) = event_store();
    adapter.fail_snapshot_writes.store(true, Ordering::SeqCst);
    store.store_events(vec![item_added("1", 1)]).await.unwrap();

    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    assert!(lookup.is_unavailable());

    adapter.fail_snapshot_writes.store(false, Ordering::SeqCst);
    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    assert_eq!(count_of(&lookup), 1);
}

#[tokio::test]
async fn snapshots_among_pending_events_are_not_folded() {
    let (store, adapter) = event_store();
    store.store_events(vec![item_added("1", 1)]).await.unwrap();

    adapter.interleaved_snapshots.lock().unwrap().push(cart_snapshot(
        Cart {
            id: "1".to_string(),
            count: 999,
            ..Cart::default()
        },
        next_timestamp(),
    ));

    store.store_events(vec![item_added("1", 2)]).await.unwrap();

    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    assert_eq!(count_of(&lookup), 3);
}

#[tokio::test]
async fn touch_refreshes_existing_snapshot_only() {
    let (store, adapter) = event_store();

    let touch: EventEnvelope<ShopEvent, ShopEntity> =
        EventEnvelope::entity_touched("Cart", EntityId::new("1"), Uuid::new_v4());
    adapter.store(vec![touch]).await.unwrap();

    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    assert_eq!(lookup, SnapshotLookup::NotFound);

    store.store_events(vec![item_added("1", 4)]).await.unwrap();
    let before = store
        .fetch_entity_snapshot("Cart", &EntityId::new("1"))
        .await
        .unwrap()
        .into_current()
        .unwrap();

    let touch: EventEnvelope<ShopEvent, ShopEntity> =
        EventEnvelope::entity_touched("Cart", EntityId::new("1"), Uuid::new_v4());
    adapter.store(vec![touch.clone()]).await.unwrap();

    let after = store
        .fetch_entity_snapshot("Cart", &EntityId::new("1"))
        .await
        .unwrap()
        .into_current()
        .unwrap();

    assert_eq!(after.value, before.value);
    assert_eq!(after.snapshotted_event_created_at, touch.created_at);
    assert_eq!(after.super_kind, SuperKind::FrameworkInternal);
}

#[tokio::test]
async fn migrated_cart_continues_as_order() {
    let (store, adapter) = event_store();
    let order = Order {
        id: "2".to_string(),
        items: 3,
        shipped: false,
    };

    store.store_events(vec![item_added("1", 3)]).await.unwrap();
    store
        .store_events(vec![EventEnvelope::entity_migrated(
            EntityMigrated {
                old_entity_name: "Cart".to_string(),
                old_entity_id: EntityId::new("1"),
                new_entity_name: "Order".to_string(),
                new_entity: ShopEntity::Order(order.clone()),
            },
            Uuid::new_v4(),
        )])
        .await
        .unwrap();
    store
        .store_events(vec![cart_event(
            "1",
            ShopEvent::OrderShipped {
                order_id: "2".to_string(),
            },
        )])
        .await
        .unwrap();

    let snapshot = store
        .fetch_entity_snapshot("Cart", &EntityId::new("1"))
        .await
        .unwrap()
        .into_current()
        .unwrap();

    assert_eq!(snapshot.entity_type_name, "Order");
    assert_eq!(snapshot.entity_id, EntityId::new("2"));
    assert_eq!(
        snapshot.value,
        ShopEntity::Order(Order {
            shipped: true,
            ..order
        })
    );

    let stored = adapter
        .latest_entity_snapshot("Order", &EntityId::new("2"))
        .await
        .unwrap();
    assert_eq!(stored.map(|s| s.value), Some(snapshot.value));
}

fn migrate_cart(cart_id: &str, order: &Order) -> EventEnvelope<ShopEvent, ShopEntity> {
    EventEnvelope::entity_migrated(
        EntityMigrated {
            old_entity_name: "Cart".to_string(),
            old_entity_id: EntityId::new(cart_id),
            new_entity_name: "Order".to_string(),
            new_entity: ShopEntity::Order(order.clone()),
        },
        Uuid::new_v4(),
    )
}

#[tokio::test]
async fn migrated_stream_is_not_replayed_twice() {
    let (store, adapter) = event_store();
    let order = Order {
        id: "7".to_string(),
        items: 1,
        shipped: false,
    };

    store.store_events(vec![item_added("1", 1)]).await.unwrap();
    store.store_events(vec![migrate_cart("1", &order)]).await.unwrap();

    let first = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    let second = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();

    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert_eq!(second.current().unwrap().entity_type_name, "Order");

    // Events recorded on the origin stream after the migration are still folded, once.
    store
        .store_events(vec![cart_event(
            "1",
            ShopEvent::OrderShipped {
                order_id: "7".to_string(),
            },
        )])
        .await
        .unwrap();

    let shipped = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();
    let again = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();

    assert_eq!(adapter.snapshot_writes.load(Ordering::SeqCst), 2);
    assert_eq!(
        shipped.current().unwrap().value,
        ShopEntity::Order(Order {
            shipped: true,
            ..order
        })
    );
    assert_eq!(shipped, again);
}

#[tokio::test]
async fn abandoned_cart_is_marked_deleted() {
    let (store, _) = event_store();
    let added = item_added("1", 2);
    let abandoned = cart_event(
        "1",
        ShopEvent::CartAbandoned {
            cart_id: "1".to_string(),
        },
    );
    store.store_events(vec![added, abandoned.clone()]).await.unwrap();

    let snapshot = store
        .fetch_entity_snapshot("Cart", &EntityId::new("1"))
        .await
        .unwrap()
        .into_current()
        .unwrap();

    assert_eq!(snapshot.deleted_at, Some(abandoned.created_at));
    assert_eq!(snapshot.value.cart().unwrap().count, 2);

    // The next event starts a new cart.
    store.store_events(vec![item_added("1", 5)]).await.unwrap();
    let lookup = store.fetch_entity_snapshot("Cart", &EntityId::new("1")).await.unwrap();

    assert_eq!(count_of(&lookup), 5);
    assert!(lookup.current().unwrap().deleted_at.is_none());
}

#[test]
fn reducer_outcome_is_three_way() {
    let current = ShopEntity::Cart(Cart::default());

    assert!(matches!(
        add_item(
            &ShopEvent::ItemAdded {
                cart_id: "1".to_string(),
                delta: 1
            },
            Some(&current)
        ),
        Ok(Action::Value(_))
    ));
    assert!(crate::fixtures::view(&ShopEvent::CartViewed { cart_id: "1".to_string() }, Some(&current))
        .unwrap()
        .is_skip());
    assert!(crate::fixtures::abandon(&ShopEvent::CartAbandoned { cart_id: "1".to_string() }, Some(&current))
        .unwrap()
        .is_delete());
}
