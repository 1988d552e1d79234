use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use typed_builder::TypedBuilder;

use crate::event::{Entity, Event, ReadModel};
use crate::registry::Registry;

/// Number of attempts of the optimistic concurrency loop of a single read model id.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Binds together the sum types of a domain.
pub trait Domain: Send + Sync + 'static {
    type Event: Event;
    type Entity: Entity;
    type ReadModel: ReadModel;
}

/// Immutable configuration shared by the event store, the read model store and the dispatcher.
/// Build it once at startup and share it behind an [`Arc`].
#[derive(TypedBuilder)]
pub struct Config<D: Domain> {
    /// Reducers, projections, sequence keys and event handlers of the domain.
    registry: Registry<D>,
    /// Bound and backoff of the read model optimistic concurrency loop.
    #[builder(default)]
    retry_policy: RetryPolicy,
}

impl<D: Domain> Config<D> {
    pub fn registry(&self) -> &Registry<D> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

/// Computes how long to wait before the next attempt of a retry loop.
pub trait Backoff: Send + Sync {
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Retry immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Wait the same amount of time before every retry.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff with full jitter: the delay is drawn uniformly between zero and
/// `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct JitteredBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff for JitteredBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent: u32 = attempt.saturating_sub(1).min(16);
        let ceiling: Duration = self.base.saturating_mul(1 << exponent).min(self.max);
        let ceiling_millis: u64 = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);

        if ceiling_millis == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_millis))
    }
}

/// Bounded retry policy used when a read model store reports a version conflict.
#[derive(Clone, TypedBuilder)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    /// Delay between two attempts.
    #[builder(default = Arc::new(NoBackoff))]
    backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
