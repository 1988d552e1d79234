use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;
use crate::config::Domain;
use crate::error::ReadModelStoreError;
use crate::event::Entity;
use crate::types::{BoxError, ReadModelId};

/// The value a join key function computes from an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKeyValue {
    One(ReadModelId),
    /// Fan-out: every id gets its own projection cycle.
    Many(Vec<ReadModelId>),
    /// The entity is not related to any read model of this projection.
    Missing,
}

/// Tells which read model(s) an entity change must update.
pub enum JoinKey<D: Domain> {
    /// The value of a field of the entity: a scalar id, or an array of ids.
    Field(String),
    /// A function computing the ids from the entity.
    Function(Arc<dyn Fn(&D::Entity) -> JoinKeyValue + Send + Sync>),
}

impl<D: Domain> JoinKey<D> {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&D::Entity) -> JoinKeyValue + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }
}

impl<D: Domain> Clone for JoinKey<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Field(name) => Self::Field(name.clone()),
            Self::Function(f) => Self::Function(Arc::clone(f)),
        }
    }
}

/// Why a projection is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectionInfoReason {
    EntityProjected,
    EntityDeleted,
}

/// Extra information handed to every projection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionInfo {
    pub reason: ProjectionInfoReason,
}

/// A read model id a projection has to be applied to.
///
/// `explicit_id` tells whether the id is passed to the projection function: it is omitted only
/// when the join key is a literal field holding a single id, in which case the projection can
/// read it from the entity itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionTarget {
    pub id: ReadModelId,
    pub explicit_id: bool,
}

type ProjectionFn<D> = dyn Fn(
        &<D as Domain>::Entity,
        Option<&ReadModelId>,
        Option<<D as Domain>::ReadModel>,
        &ProjectionInfo,
    ) -> Result<Action<<D as Domain>::ReadModel>, BoxError>
    + Send
    + Sync;

/// A projection of an entity type into a read model.
pub struct ProjectionRegistration<D: Domain> {
    entity_type_name: String,
    read_model_name: String,
    method_name: String,
    join_key: JoinKey<D>,
    projection: Arc<ProjectionFn<D>>,
}

impl<D: Domain> ProjectionRegistration<D> {
    pub(crate) fn new<F>(
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
        Self {
            entity_type_name: entity_type_name.to_string(),
            read_model_name: read_model_name.to_string(),
            method_name: method_name.to_string(),
            join_key,
            projection: Arc::new(projection),
        }
    }

    pub fn entity_type_name(&self) -> &str {
        &self.entity_type_name
    }

    pub fn read_model_name(&self) -> &str {
        &self.read_model_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// `ReadModel.method`, as stamped in the read model metadata.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.read_model_name, self.method_name)
    }

    pub fn join_key(&self) -> &JoinKey<D> {
        &self.join_key
    }

    /// Resolves the read model ids the given entity maps to. Duplicated ids are collapsed, so
    /// that no two cycles race on the same read model. An empty list means the entity does not
    /// carry the join key.
    pub fn targets(&self, entity: &D::Entity) -> Result<Vec<ProjectionTarget>, ReadModelStoreError> {
        let targets: Vec<ProjectionTarget> = match &self.join_key {
            JoinKey::Field(name) => match entity.field(name) {
                None | Some(Value::Null) => vec![],
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        read_model_id_from_value(item)
                            .map(|id| ProjectionTarget { id, explicit_id: true })
                            .ok_or_else(|| self.invalid_join_key(item))
                    })
                    .collect::<Result<_, _>>()?,
                Some(scalar) => {
                    let id = read_model_id_from_value(&scalar).ok_or_else(|| self.invalid_join_key(&scalar))?;
                    vec![ProjectionTarget { id, explicit_id: false }]
                }
            },
            JoinKey::Function(f) => match f(entity) {
                JoinKeyValue::One(id) => vec![ProjectionTarget { id, explicit_id: true }],
                JoinKeyValue::Many(ids) => ids
                    .into_iter()
                    .map(|id| ProjectionTarget { id, explicit_id: true })
                    .collect(),
                JoinKeyValue::Missing => vec![],
            },
        };

        let mut unique: Vec<ProjectionTarget> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.iter().any(|t| t.id == target.id) {
                unique.push(target);
            }
        }

        Ok(unique)
    }

    pub fn project(
        &self,
        entity: &D::Entity,
        target: &ProjectionTarget,
        current: Option<D::ReadModel>,
        info: &ProjectionInfo,
    ) -> Result<Action<D::ReadModel>, BoxError> {
        let id: Option<&ReadModelId> = target.explicit_id.then_some(&target.id);
        (self.projection)(entity, id, current, info)
    }

    fn invalid_join_key(&self, value: &Value) -> ReadModelStoreError {
        ReadModelStoreError::InvalidJoinKey {
            method: self.qualified_name(),
            value: value.clone(),
        }
    }
}

impl<D: Domain> Clone for ProjectionRegistration<D> {
    fn clone(&self) -> Self {
        Self {
            entity_type_name: self.entity_type_name.clone(),
            read_model_name: self.read_model_name.clone(),
            method_name: self.method_name.clone(),
            join_key: self.join_key.clone(),
            projection: Arc::clone(&self.projection),
        }
    }
}

impl<D: Domain> std::fmt::Debug for ProjectionRegistration<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRegistration")
            .field("entity_type_name", &self.entity_type_name)
            .field("projection", &self.qualified_name())
            .finish()
    }
}

/// Strings and numbers can be read model ids.
pub(crate) fn read_model_id_from_value(value: &Value) -> Option<ReadModelId> {
    match value {
        Value::String(id) => Some(ReadModelId::new(id.clone())),
        Value::Number(id) => Some(ReadModelId::new(id.to_string())),
        _ => None,
    }
}
