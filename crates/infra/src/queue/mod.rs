//! Work queue: durable, at-least-once hand-off of job descriptors to workers.
//!
//! A dequeued message stays invisible to other consumers until it is acked,
//! nacked, or its visibility timeout lapses. A lapsed message is delivered
//! again with a higher `delivery_count`. Workers extend the timeout while they
//! are alive via [`WorkQueue::extend`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use mediagraph_core::JobDescriptor;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryWorkQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsWorkQueue;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The broker could not be reached; retrying may succeed.
    #[error("work queue unavailable: {0}")]
    Unavailable(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("work queue error: {0}")]
    Backend(String),

    /// The handle does not name an in-flight message (already acked, or redelivered elsewhere).
    #[error("unknown delivery handle: {0}")]
    UnknownHandle(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Opaque token identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle(String);

impl AckHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AckHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub descriptor: JobDescriptor,
    pub handle: AckHandle,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

pub trait WorkQueue: Send + Sync {
    /// Append a descriptor. Returns the broker's message id.
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<String, QueueError>;

    /// Take the next message, waiting up to `wait`. `Ok(None)` when nothing arrived.
    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered message for good.
    fn ack(&self, handle: &AckHandle) -> Result<(), QueueError>;

    /// Give a delivered message back. With `requeue` it is delivered again;
    /// without, it is moved aside and never delivered again.
    fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), QueueError>;

    /// Restart the visibility timeout of an in-flight message.
    fn extend(&self, handle: &AckHandle) -> Result<(), QueueError>;
}

impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<String, QueueError> {
        (**self).enqueue(descriptor)
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(wait)
    }

    fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        (**self).ack(handle)
    }

    fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), QueueError> {
        (**self).nack(handle, requeue)
    }

    fn extend(&self, handle: &AckHandle) -> Result<(), QueueError> {
        (**self).extend(handle)
    }
}
