/// Outcome of a reducer or a projection.
///
/// - [`Action::Value`] carries the new entity (or read model) state.
/// - [`Action::Skip`] leaves the current state untouched.
/// - [`Action::Delete`] removes the current state. For a reducer it marks the entity as deleted;
///   for a projection it deletes the read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<T> {
    Value(T),
    Skip,
    Delete,
}

impl<T> Action<T> {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Action<U> {
        match self {
            Self::Value(value) => Action::Value(f(value)),
            Self::Skip => Action::Skip,
            Self::Delete => Action::Delete,
        }
    }
}

impl<T> From<T> for Action<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}
