//! Explicit lookup tables built once at startup: reducers by event type, projections and
//! unprojections by entity type, sequence keys and schema versions by read model, and event
//! handlers by event type.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

pub use projection::{
    JoinKey, JoinKeyValue, ProjectionInfo, ProjectionInfoReason, ProjectionRegistration, ProjectionTarget,
};
pub use reducer::ReducerRegistration;

use crate::action::Action;
use crate::config::Domain;
use crate::envelope::{EventEnvelope, ENTITY_MIGRATED, ENTITY_TOUCHED};
use crate::error::{EventStoreError, RegistryError};
use crate::event::{Entity, Event};
use crate::handler::EventHandler;
use crate::types::{BoxError, ReadModelId, SequenceKey, UserEnvelope};

mod projection;
mod reducer;

/// Schema version of read models that don't declare one.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// The validated registrations of a domain. Use [`RegistryBuilder`] to create one.
pub struct Registry<D: Domain> {
    reducers: HashMap<String, ReducerRegistration<D>>,
    projections: HashMap<String, Vec<ProjectionRegistration<D>>>,
    unprojections: HashMap<String, Vec<ProjectionRegistration<D>>>,
    sequence_keys: HashMap<String, String>,
    schema_versions: HashMap<String, u32>,
    event_handlers: HashMap<String, Vec<Arc<dyn EventHandler<D>>>>,
}

impl<D: Domain> Registry<D> {
    pub fn builder() -> RegistryBuilder<D> {
        RegistryBuilder::default()
    }

    pub fn reducer(&self, event_type_name: &str) -> Option<&ReducerRegistration<D>> {
        self.reducers.get(event_type_name)
    }

    /// Projections of the given entity type, in registration order.
    pub fn projections_for(&self, entity_type_name: &str) -> &[ProjectionRegistration<D>] {
        self.projections
            .get(entity_type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Projections run when an entity of the given type gets deleted, in registration order.
    pub fn unprojections_for(&self, entity_type_name: &str) -> &[ProjectionRegistration<D>] {
        self.unprojections
            .get(entity_type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn sequence_key_field(&self, read_model_name: &str) -> Option<&str> {
        self.sequence_keys.get(read_model_name).map(String::as_str)
    }

    /// Reads the sequence key of the given read model from the entity, if the read model declares
    /// one and the entity carries it.
    pub fn sequence_key_for(&self, read_model_name: &str, entity: &D::Entity) -> Option<SequenceKey> {
        let name: &str = self.sequence_key_field(read_model_name)?;
        let value: ReadModelId = entity
            .field(name)
            .as_ref()
            .and_then(projection::read_model_id_from_value)?;

        Some(SequenceKey {
            name: name.to_string(),
            value: value.as_str().to_string(),
        })
    }

    pub fn schema_version(&self, read_model_name: &str) -> u32 {
        self.schema_versions
            .get(read_model_name)
            .copied()
            .unwrap_or(DEFAULT_SCHEMA_VERSION)
    }

    pub fn event_handlers_for(&self, event_type_name: &str) -> &[Arc<dyn EventHandler<D>>] {
        self.event_handlers
            .get(event_type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Wraps a domain event into an envelope recorded in the stream of the entity its reducer
    /// folds into, keyed by the event's own entity id.
    pub fn envelope_for(
        &self,
        event: D::Event,
        request_id: Uuid,
        current_user: Option<UserEnvelope>,
    ) -> Result<EventEnvelope<D::Event, D::Entity>, EventStoreError> {
        let entity_type_name: String = self
            .reducer(event.type_name())
            .ok_or_else(|| EventStoreError::MissingReducer(event.type_name().to_string()))?
            .entity_type_name()
            .to_string();
        let entity_id = event.entity_id();

        Ok(EventEnvelope::domain(entity_type_name, entity_id, event, request_id, current_user))
    }
}

/// Collects registrations and validates them all at once in [`RegistryBuilder::build`].
pub struct RegistryBuilder<D: Domain> {
    reducers: Vec<ReducerRegistration<D>>,
    projections: Vec<ProjectionRegistration<D>>,
    unprojections: Vec<ProjectionRegistration<D>>,
    sequence_keys: Vec<(String, String)>,
    schema_versions: HashMap<String, u32>,
    event_handlers: Vec<(String, Arc<dyn EventHandler<D>>)>,
}

impl<D: Domain> Default for RegistryBuilder<D> {
    fn default() -> Self {
        Self {
            reducers: vec![],
            projections: vec![],
            unprojections: vec![],
            sequence_keys: vec![],
            schema_versions: HashMap::new(),
            event_handlers: vec![],
        }
    }
}

impl<D: Domain> RegistryBuilder<D> {
    /// Registers `entity_type_name.method_name` as the reducer of `event_type_name`.
    pub fn reducer<F>(mut self, event_type_name: &str, entity_type_name: &str, method_name: &str, reducer: F) -> Self
    where
        F: Fn(&D::Event, Option<&D::Entity>) -> Result<Action<D::Entity>, BoxError> + Send + Sync + 'static,
    {
        self.reducers.push(ReducerRegistration::new(
            event_type_name,
            entity_type_name,
            method_name,
            reducer,
        ));
        self
    }

    /// Registers a projection of `entity_type_name` into `read_model_name`.
    pub fn projection<F>(
        mut self,
        entity_type_name: &str,
        read_model_name: &str,
        method_name: &str,
        join_key: JoinKey<D>,
        projection: F,
    ) -> Self
    where
        F: Fn(&D::Entity, Option<&ReadModelId>, Option<D::ReadModel>, &ProjectionInfo) -> Result<Action<D::ReadModel>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.projections.push(ProjectionRegistration::new(
            entity_type_name,
            read_model_name,
            method_name,
            join_key,
            projection,
        ));
        self
    }

    /// Registers the projection run instead of the regular ones when an entity of
    /// `entity_type_name` gets deleted.
    pub fn unprojection<F>(
        mut self,
        entity_type_name: &str,
        read_model_name: &str,
        method_name: &str,
        join_key: JoinKey<D>,
        projection: F,
    ) -> Self
    where
        F: Fn(&D::Entity, Option<&ReadModelId>, Option<D::ReadModel>, &ProjectionInfo) -> Result<Action<D::ReadModel>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.unprojections.push(ProjectionRegistration::new(
            entity_type_name,
            read_model_name,
            method_name,
            join_key,
            projection,
        ));
        self
    }

    /// Declares the entity field holding the sequence key of `read_model_name`.
    pub fn sequence_key(mut self, read_model_name: &str, field: &str) -> Self {
        self.sequence_keys
            .push((read_model_name.to_string(), field.to_string()));
        self
    }

    pub fn schema_version(mut self, read_model_name: &str, version: u32) -> Self {
        self.schema_versions.insert(read_model_name.to_string(), version);
        self
    }

    /// Adds a handler for every dispatched event of type `event_type_name`.
    pub fn event_handler(mut self, event_type_name: &str, event_handler: impl EventHandler<D> + 'static) -> Self {
        self.event_handlers
            .push((event_type_name.to_string(), Arc::new(event_handler)));
        self
    }

    /// Validates every registration.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if an event type has more than one reducer, if a reducer is registered
    /// for a framework-internal event type, if the same projection is registered twice for an
    /// entity, or if a read model has more than one sequence key.
    pub fn build(self) -> Result<Registry<D>, RegistryError> {
        let mut reducers: HashMap<String, ReducerRegistration<D>> = HashMap::new();
        for registration in self.reducers {
            let event_type_name: &str = registration.event_type_name();

            if event_type_name == ENTITY_MIGRATED || event_type_name == ENTITY_TOUCHED {
                return Err(RegistryError::ReservedEventType(event_type_name.to_string()));
            }

            if let Some(existing) = reducers.get(event_type_name) {
                return Err(RegistryError::DuplicateReducer {
                    event_type_name: event_type_name.to_string(),
                    first: existing.qualified_name(),
                    second: registration.qualified_name(),
                });
            }

            reducers.insert(event_type_name.to_string(), registration);
        }

        let mut sequence_keys: HashMap<String, String> = HashMap::new();
        for (read_model_name, field) in self.sequence_keys {
            if sequence_keys.contains_key(&read_model_name) {
                return Err(RegistryError::DuplicateSequenceKey(read_model_name));
            }
            sequence_keys.insert(read_model_name, field);
        }

        let mut event_handlers: HashMap<String, Vec<Arc<dyn EventHandler<D>>>> = HashMap::new();
        for (event_type_name, handler) in self.event_handlers {
            event_handlers.entry(event_type_name).or_default().push(handler);
        }

        Ok(Registry {
            reducers,
            projections: group_projections(self.projections)?,
            unprojections: group_projections(self.unprojections)?,
            sequence_keys,
            schema_versions: self.schema_versions,
            event_handlers,
        })
    }
}

fn group_projections<D: Domain>(
    registrations: Vec<ProjectionRegistration<D>>,
) -> Result<HashMap<String, Vec<ProjectionRegistration<D>>>, RegistryError> {
    let mut grouped: HashMap<String, Vec<ProjectionRegistration<D>>> = HashMap::new();

    for registration in registrations {
        let siblings = grouped
            .entry(registration.entity_type_name().to_string())
            .or_default();

        if siblings
            .iter()
            .any(|sibling| sibling.qualified_name() == registration.qualified_name())
        {
            return Err(RegistryError::DuplicateProjection {
                entity_type_name: registration.entity_type_name().to_string(),
                method: registration.qualified_name(),
            });
        }

        siblings.push(registration);
    }

    Ok(grouped)
}
