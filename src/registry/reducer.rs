use std::sync::Arc;

use crate::action::Action;
use crate::config::Domain;
use crate::types::BoxError;

type ReducerFn<D> = dyn Fn(&<D as Domain>::Event, Option<&<D as Domain>::Entity>) -> Result<Action<<D as Domain>::Entity>, BoxError>
    + Send
    + Sync;

/// The reducer folding one event type into an entity.
pub struct ReducerRegistration<D: Domain> {
    event_type_name: String,
    entity_type_name: String,
    method_name: String,
    reducer: Arc<ReducerFn<D>>,
}

impl<D: Domain> ReducerRegistration<D> {
    pub(crate) fn new<F>(event_type_name: &str, entity_type_name: &str, method_name: &str, reducer: F) -> Self
    where
        F: Fn(&D::Event, Option<&D::Entity>) -> Result<Action<D::Entity>, BoxError> + Send + Sync + 'static,
    {
        Self {
            event_type_name: event_type_name.to_string(),
            entity_type_name: entity_type_name.to_string(),
            method_name: method_name.to_string(),
            reducer: Arc::new(reducer),
        }
    }

    pub fn event_type_name(&self) -> &str {
        &self.event_type_name
    }

    /// The entity the reducer folds into. This might differ from the entity type of the stream
    /// the event was read from.
    pub fn entity_type_name(&self) -> &str {
        &self.entity_type_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// `Entity.method`, used in logs and errors.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.entity_type_name, self.method_name)
    }

    pub fn reduce(&self, event: &D::Event, current: Option<&D::Entity>) -> Result<Action<D::Entity>, BoxError> {
        (self.reducer)(event, current)
    }
}

impl<D: Domain> Clone for ReducerRegistration<D> {
    fn clone(&self) -> Self {
        Self {
            event_type_name: self.event_type_name.clone(),
            entity_type_name: self.entity_type_name.clone(),
            method_name: self.method_name.clone(),
            reducer: Arc::clone(&self.reducer),
        }
    }
}

impl<D: Domain> std::fmt::Debug for ReducerRegistration<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerRegistration")
            .field("event_type_name", &self.event_type_name)
            .field("reducer", &self.qualified_name())
            .finish()
    }
}
