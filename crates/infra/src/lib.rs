//! Infrastructure layer: result store, work queue, workers and the job lifecycle.
//!
//! Everything here is synchronous. Backends sit behind [`ResultStore`] and
//! [`WorkQueue`]; in-memory implementations are always available and the Redis
//! ones are behind the `redis` feature.

pub mod config;
pub mod lifecycle;
pub mod queue;
pub mod retry;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, Settings};
pub use lifecycle::{CancelAck, JobError, LifecycleConfig, LifecycleManager};
pub use queue::{AckHandle, Delivery, InMemoryWorkQueue, QueueError, WorkQueue};
pub use retry::{BackoffStrategy, Resilient, RetryPolicy};
pub use store::{InMemoryResultStore, ResultStore, StoreError, UpdateOutcome};
pub use workers::{DeliveryOutcome, Worker, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};

#[cfg(feature = "redis")]
pub use queue::RedisStreamsWorkQueue;
#[cfg(feature = "redis")]
pub use store::RedisResultStore;
