use std::ops::Deref;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::StreamEnvelope;
use crate::event::{Entity, Event};
use crate::types::BoxError;

/// The responsibility of the [`EventStreamProducer`] trait is to publish the events of an entity on
/// a stream based transport, to be consumed later by an [`crate::dispatch::EventDispatcher`].
#[async_trait]
pub trait EventStreamProducer<E, S>: Send + Sync
where
    E: Event,
    S: Entity,
{
    /// Publishes the envelopes of a single entity, in order. Stream envelopes are used on the
    /// wire so that every serialized entry carries its `kind`.
    async fn publish(&self, envelopes: Vec<StreamEnvelope<E, S>>) -> Result<(), BoxError>;
}

#[async_trait]
impl<E, S, P, T> EventStreamProducer<E, S> for T
where
    E: Event,
    S: Entity,
    P: EventStreamProducer<E, S> + ?Sized,
    T: Deref<Target = P> + Send + Sync,
{
    async fn publish(&self, envelopes: Vec<StreamEnvelope<E, S>>) -> Result<(), BoxError> {
        self.deref().publish(envelopes).await
    }
}

#[derive(thiserror::Error, Debug)]
#[error("event stream is closed")]
pub struct StreamClosed;

/// Creates an in-process event stream holding at most `capacity` pending batches. A capacity of
/// zero is treated as one.
pub fn in_memory_event_stream<E, S>(capacity: usize) -> (InMemoryEventStream<E, S>, InMemoryEventStreamConsumer<E, S>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));

    (
        InMemoryEventStream { sender },
        InMemoryEventStreamConsumer { receiver },
    )
}

/// Producing side of an in-process event stream backed by a tokio channel.
pub struct InMemoryEventStream<E, S> {
    sender: mpsc::Sender<Vec<StreamEnvelope<E, S>>>,
}

impl<E, S> Clone for InMemoryEventStream<E, S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl<E, S> EventStreamProducer<E, S> for InMemoryEventStream<E, S>
where
    E: Event,
    S: Entity,
{
    async fn publish(&self, envelopes: Vec<StreamEnvelope<E, S>>) -> Result<(), BoxError> {
        self.sender.send(envelopes).await.map_err(|_| Box::new(StreamClosed) as BoxError)
    }
}

/// Consuming side of an in-process event stream.
pub struct InMemoryEventStreamConsumer<E, S> {
    receiver: mpsc::Receiver<Vec<StreamEnvelope<E, S>>>,
}

impl<E, S> InMemoryEventStreamConsumer<E, S> {
    /// Waits for the next batch. Returns `None` once every producer has been dropped and the
    /// stream is drained.
    pub async fn next_batch(&mut self) -> Option<Vec<StreamEnvelope<E, S>>> {
        self.receiver.recv().await
    }

    /// Returns the next batch if one is already available.
    pub fn try_next_batch(&mut self) -> Option<Vec<StreamEnvelope<E, S>>> {
        self.receiver.try_recv().ok()
    }
}
