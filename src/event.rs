use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::types::EntityId;

/// The sum type of every event a domain can emit.
///
/// Every variant must be identified by a stable type name: it is the tag stored in the
/// [`crate::envelope::EventEnvelope`] and the key used to look up its reducer.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Returns the type name of this event variant.
    fn type_name(&self) -> &'static str;

    /// Returns the id of the entity this event belongs to. This is the partition key of the
    /// event stream the event is recorded in.
    fn entity_id(&self) -> EntityId;
}

/// The sum type of every entity state a domain can reconstruct by folding events.
pub trait Entity: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Returns the identity of this entity instance.
    fn id(&self) -> EntityId;

    /// Returns the JSON value of the given field, used by literal-field join keys and sequence
    /// keys.
    ///
    /// The default implementation serializes the entity and looks the field up at the top level,
    /// descending into the single variant of an externally tagged enum if needed. Override it if
    /// the entity serializes differently.
    fn field(&self, name: &str) -> Option<Value> {
        serde_json::to_value(self)
            .ok()
            .and_then(|value| lookup_field(&value, name).cloned())
    }
}

/// The sum type of every read model a domain projects.
pub trait ReadModel: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}

impl<T> ReadModel for T where T: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}

/// Looks a field up in a JSON object. If the object is the representation of an externally
/// tagged enum variant (a single key wrapping an object) the lookup continues in the wrapped
/// object.
pub fn lookup_field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let object = value.as_object()?;

    if let Some(found) = object.get(name) {
        return Some(found);
    }

    match object.values().next() {
        Some(inner @ Value::Object(_)) if object.len() == 1 => inner.as_object()?.get(name),
        _ => None,
    }
}
