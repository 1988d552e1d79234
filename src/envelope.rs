use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Entity, Event};
use crate::time::next_timestamp;
use crate::types::{EntityId, SuperKind, UserEnvelope};

/// Type name of the framework-internal event recording that an entity became another one.
pub const ENTITY_MIGRATED: &str = "EntityMigrated";
/// Type name of the framework-internal event refreshing a snapshot without changing it.
pub const ENTITY_TOUCHED: &str = "EntityTouched";

/// Version stamped on every envelope built by this crate.
pub const ENVELOPE_VERSION: u32 = 1;

/// Payload of the [`ENTITY_MIGRATED`] event: the stream of `old_entity_name#old_entity_id`
/// continues as `new_entity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMigrated<S> {
    pub old_entity_name: String,
    pub old_entity_id: EntityId,
    pub new_entity_name: String,
    pub new_entity: S,
}

/// Payload of the [`ENTITY_TOUCHED`] event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTouched {
    pub entity_name: String,
    pub entity_id: EntityId,
}

/// The payload of an [`EventEnvelope`]: either a domain event or one of the framework-internal
/// events that get special handling while folding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventValue<E, S> {
    Domain(E),
    EntityMigrated(EntityMigrated<S>),
    EntityTouched(EntityTouched),
}

/// An event as it is persisted in the event store. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<E, S> {
    pub version: u32,
    pub super_kind: SuperKind,
    #[serde(rename = "entityID")]
    pub entity_id: EntityId,
    pub entity_type_name: String,
    pub type_name: String,
    pub value: EventValue<E, S>,
    #[serde(rename = "requestID")]
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<UserEnvelope>,
    pub created_at: DateTime<Utc>,
}

impl<E, S> EventEnvelope<E, S>
where
    E: Event,
    S: Entity,
{
    /// Wraps a domain event emitted for `entity_type_name#entity_id`.
    pub fn domain(
        entity_type_name: impl Into<String>,
        entity_id: EntityId,
        event: E,
        request_id: Uuid,
        current_user: Option<UserEnvelope>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            super_kind: SuperKind::Domain,
            entity_id,
            entity_type_name: entity_type_name.into(),
            type_name: event.type_name().to_string(),
            value: EventValue::Domain(event),
            request_id,
            current_user,
            created_at: next_timestamp(),
        }
    }

    /// Builds the migration event. It is recorded in the stream of the *origin* entity, even
    /// though it describes the entity it becomes.
    pub fn entity_migrated(migration: EntityMigrated<S>, request_id: Uuid) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            super_kind: SuperKind::FrameworkInternal,
            entity_id: migration.old_entity_id.clone(),
            entity_type_name: migration.old_entity_name.clone(),
            type_name: ENTITY_MIGRATED.to_string(),
            value: EventValue::EntityMigrated(migration),
            request_id,
            current_user: None,
            created_at: next_timestamp(),
        }
    }

    /// Builds the touch event for the given entity.
    pub fn entity_touched(entity_name: impl Into<String>, entity_id: EntityId, request_id: Uuid) -> Self {
        let entity_name: String = entity_name.into();

        Self {
            version: ENVELOPE_VERSION,
            super_kind: SuperKind::FrameworkInternal,
            entity_id: entity_id.clone(),
            entity_type_name: entity_name.clone(),
            type_name: ENTITY_TOUCHED.to_string(),
            value: EventValue::EntityTouched(EntityTouched { entity_name, entity_id }),
            request_id,
            current_user: None,
            created_at: next_timestamp(),
        }
    }

    /// Returns the domain payload, if this is not a framework-internal event.
    pub fn domain_event(&self) -> Option<&E> {
        match &self.value {
            EventValue::Domain(event) => Some(event),
            _ => None,
        }
    }
}

/// A point-in-time value of an entity, together with the cursor of the last event folded into
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshotEnvelope<S> {
    pub version: u32,
    pub super_kind: SuperKind,
    #[serde(rename = "entityID")]
    pub entity_id: EntityId,
    pub entity_type_name: String,
    pub type_name: String,
    pub value: S,
    #[serde(rename = "requestID")]
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<UserEnvelope>,
    pub created_at: DateTime<Utc>,
    pub snapshotted_event_created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl<S> EntitySnapshotEnvelope<S> {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Anything an event stream can contain: events and, as race artifacts, snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamEnvelope<E, S> {
    Event(EventEnvelope<E, S>),
    Snapshot(EntitySnapshotEnvelope<S>),
}

impl<E, S> StreamEnvelope<E, S> {
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event(_))
    }

    pub fn into_event(self) -> Option<EventEnvelope<E, S>> {
        match self {
            Self::Event(event) => Some(event),
            Self::Snapshot(_) => None,
        }
    }

    pub fn entity_type_name(&self) -> &str {
        match self {
            Self::Event(event) => &event.entity_type_name,
            Self::Snapshot(snapshot) => &snapshot.entity_type_name,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Event(event) => &event.entity_id,
            Self::Snapshot(snapshot) => &snapshot.entity_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Event(event) => event.created_at,
            Self::Snapshot(snapshot) => snapshot.created_at,
        }
    }
}

impl<E, S> From<EventEnvelope<E, S>> for StreamEnvelope<E, S> {
    fn from(event: EventEnvelope<E, S>) -> Self {
        Self::Event(event)
    }
}

impl<E, S> From<EntitySnapshotEnvelope<S>> for StreamEnvelope<E, S> {
    fn from(snapshot: EntitySnapshotEnvelope<S>) -> Self {
        Self::Snapshot(snapshot)
    }
}
