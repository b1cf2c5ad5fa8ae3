//! Event publishing/subscription abstraction (mechanics only).
//!
//! Pub/sub distribution of envelopes to consumers (projections, workers).
//! The bus is intentionally **lightweight**:
//!
//! - **Transport-agnostic**: in-memory channels today, a broker tomorrow.
//! - **At-least-once delivery**: consumers must be idempotent. That is safe
//!   here because events are appended to the event store *before* they are
//!   published, and every projection skips sequence numbers it has already
//!   seen, so redelivery is a no-op.
//! - **No persistence**: the bus distributes, the event store is the source of
//!   truth. A consumer that missed messages rebuilds from the store.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published to the bus
/// (broadcast semantics) and is meant to be drained by a single consumer
/// thread:
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(envelope) => apply(envelope)?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// Sits between the event store and event consumers:
///
/// ```text
/// Command → Event Store (append) → Event Bus (publish) → Projections
/// ```
///
/// Events are **stored first**, then published. If publication fails they are
/// still in the store and can be republished, so `publish` errors are
/// surfaced to the caller rather than retried here.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
