use std::ops::Deref;

use async_trait::async_trait;

use crate::config::Domain;
use crate::envelope::EventEnvelope;
use crate::types::BoxError;

/// This trait is used to implement an `EventHandler`. An event handler is run for every dispatched
/// event of the type it is registered for, after the entity has been reconstructed and projected.
/// It is the place for side effects: notifications, integration with other services...
///
/// A failing handler never stops the dispatch of the batch: the error gets logged.
#[async_trait]
pub trait EventHandler<D>: Send + Sync
where
    D: Domain,
{
    /// Handle an event and perform a side effect.
    async fn handle(&self, event: &EventEnvelope<D::Event, D::Entity>) -> Result<(), BoxError>;

    /// The name of the event handler. By default, this is the type name of the event handler,
    /// but it can be overridden to provide a custom name. This name is used as
    /// part of tracing spans, to identify the event handler being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
impl<D, Q, T> EventHandler<D> for T
where
    D: Domain,
    Q: EventHandler<D> + ?Sized,
    T: Deref<Target = Q> + Send + Sync,
{
    /// Deref call to [`EventHandler::handle`].
    async fn handle(&self, event: &EventEnvelope<D::Event, D::Entity>) -> Result<(), BoxError> {
        self.deref().handle(event).await
    }

    /// Deref call to [`EventHandler::name`].
    fn name(&self) -> &'static str {
        self.deref().name()
    }
}
