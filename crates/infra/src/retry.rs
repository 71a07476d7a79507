//! Bounded retries of transient backend failures.
//!
//! [`Resilient`] wraps a [`ResultStore`] or [`WorkQueue`] and retries calls that
//! fail with a transient (connection-level) error, sleeping per [`RetryPolicy`]
//! between tries. Non-transient errors and `dequeue` pass straight through; the
//! worker loop paces its own polling.
//!
//! A retried `update` re-runs the mutator against whatever is stored by then.
//! When the lost reply belonged to a committed write, the mutator sees its own
//! earlier result and the transition methods on the record decline it.

use std::thread;
use std::time::Duration;

use tracing::warn;

use mediagraph_core::{JobDescriptor, JobId, JobRecord};

use crate::queue::{AckHandle, Delivery, QueueError, WorkQueue};
use crate::store::{Mutator, ResultStore, StoreError, UpdateOutcome};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first try (0 = no retries)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi((attempt - 1) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so concurrent callers don't retry in lockstep.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op`, retrying while `is_transient` holds and attempts remain.
    pub fn run<T, E>(
        &self,
        what: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: core::fmt::Display,
    {
        let mut retries = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && self.should_retry(retries) => {
                    retries += 1;
                    let delay = self.delay_for_attempt(retries);
                    warn!(operation = what, retry = retries, delay_ms = delay.as_millis() as u64, error = %e, "transient failure, retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retrying wrapper around a store or queue.
#[derive(Debug, Clone)]
pub struct Resilient<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Resilient<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<S: ResultStore> ResultStore for Resilient<S> {
    fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.policy
            .run("store.put", StoreError::is_transient, || self.inner.put(record))
    }

    fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        self.policy
            .run("store.get", StoreError::is_transient, || self.inner.get(job_id))
    }

    fn update(&self, job_id: &JobId, mutator: &mut Mutator<'_>) -> Result<UpdateOutcome, StoreError> {
        self.policy.run("store.update", StoreError::is_transient, || {
            self.inner.update(job_id, &mut *mutator)
        })
    }

    fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        self.policy
            .run("store.delete", StoreError::is_transient, || self.inner.delete(job_id))
    }

    fn expire_after(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError> {
        self.policy.run("store.expire_after", StoreError::is_transient, || {
            self.inner.expire_after(job_id, ttl)
        })
    }
}

impl<Q: WorkQueue> WorkQueue for Resilient<Q> {
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<String, QueueError> {
        self.policy
            .run("queue.enqueue", QueueError::is_transient, || self.inner.enqueue(descriptor))
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.inner.dequeue(wait)
    }

    fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        self.policy
            .run("queue.ack", QueueError::is_transient, || self.inner.ack(handle))
    }

    fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), QueueError> {
        self.policy
            .run("queue.nack", QueueError::is_transient, || self.inner.nack(handle, requeue))
    }

    fn extend(&self, handle: &AckHandle) -> Result<(), QueueError> {
        self.policy
            .run("queue.extend", QueueError::is_transient, || self.inner.extend(handle))
    }
}
