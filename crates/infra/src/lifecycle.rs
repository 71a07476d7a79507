//! Job lifecycle façade used by the API boundary.
//!
//! ```text
//! submit(kind, input)
//!   ↓
//! 1. Validate input (synchronous; nothing is created on failure)
//!   ↓
//! 2. Write PENDING record to the result store
//!   ↓
//! 3. Enqueue descriptor; the broker's id is the durable acknowledgement
//!   ↓  (enqueue failed → delete record, or mark it FAILED if that fails too)
//! job_id
//! ```
//!
//! `get_status` reads the store. `cancel` moves PENDING straight to CANCELLED and
//! RUNNING to CANCEL_REQUESTED; anything else is left as is and still reported as
//! accepted. All writes go through [`ResultStore::update`], so a cancel racing a
//! worker's final write is linearised by the store.

use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use mediagraph_core::input::DEFAULT_MAX_INPUT_BYTES;
use mediagraph_core::{
    DomainError, ErrorDescriptor, ErrorKind, JobDescriptor, JobId, JobKind, JobRecord, JobState, validate_input,
};

use crate::queue::{QueueError, WorkQueue};
use crate::store::{ResultStore, StoreError};

pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);

/// Error surfaced to callers of the lifecycle façade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Bad kind or input; no job was created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The descriptor could not be durably enqueued; no job was left behind.
    #[error("work queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Unknown, malformed, or expired job id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The result store could not be reached; retrying may succeed.
    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for JobError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => JobError::NotFound(id.to_string()),
            other => JobError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => JobError::Validation(msg),
            other => JobError::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Expiry applied to every record write
    pub ttl: Duration,
    /// Largest accepted serialised input
    pub max_input_bytes: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_JOB_TTL,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

/// Result of a cancel call. Always `accepted`; `state` is the state after the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAck {
    pub job_id: JobId,
    pub accepted: bool,
    pub state: JobState,
}

/// Creates, reads and cancels jobs on top of a result store and a work queue.
#[derive(Debug, Clone)]
pub struct LifecycleManager<S, Q> {
    store: S,
    queue: Q,
    config: LifecycleConfig,
}

impl<S, Q> LifecycleManager<S, Q>
where
    S: ResultStore,
    Q: WorkQueue,
{
    pub fn new(store: S, queue: Q) -> Self {
        Self::with_config(store, queue, LifecycleConfig::default())
    }

    pub fn with_config(store: S, queue: Q, config: LifecycleConfig) -> Self {
        Self { store, queue, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Create a PENDING job and hand it to the workers.
    #[instrument(skip(self, input), fields(kind = %kind), err)]
    pub fn submit(&self, kind: JobKind, input: JsonValue) -> Result<JobId, JobError> {
        let input = validate_input(kind, input, self.config.max_input_bytes)?;
        let record = JobRecord::new(kind, input, self.config.ttl);
        self.store.put(&record)?;

        match self.queue.enqueue(&JobDescriptor::for_record(&record)) {
            Ok(message_id) => {
                info!(job_id = %record.job_id, message_id = %message_id, "job submitted");
                Ok(record.job_id)
            }
            Err(e) => {
                self.roll_back(&record.job_id, &e);
                Err(JobError::QueueUnavailable(e.to_string()))
            }
        }
    }

    /// Make sure a job whose descriptor never reached the queue does not linger as PENDING.
    fn roll_back(&self, job_id: &JobId, cause: &QueueError) {
        warn!(job_id = %job_id, error = %cause, "enqueue failed, rolling back job");

        let Err(delete_err) = self.store.delete(job_id) else {
            return;
        };

        let message = format!("job could not be queued: {cause}");
        let marked = self.store.update(job_id, &mut |record| {
            let mut next = record.clone();
            next.fail(ErrorDescriptor::new(ErrorKind::QueueUnavailable, message.clone()))
                .ok()?;
            Some(next)
        });
        if let Err(e) = marked {
            error!(job_id = %job_id, delete_error = %delete_err, error = %e, "could not roll back job record");
        }
    }

    fn parse_id(raw: &str) -> Result<JobId, JobError> {
        raw.parse::<JobId>()
            .map_err(|_| JobError::NotFound(raw.to_string()))
    }

    /// Current record for `job_id`.
    pub fn get_status(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let job_id = Self::parse_id(job_id)?;
        Ok(self.store.get(&job_id)?)
    }

    /// Request cancellation. Idempotent: terminal or already-requested jobs are left alone.
    #[instrument(skip(self), err)]
    pub fn cancel(&self, job_id: &str) -> Result<CancelAck, JobError> {
        let job_id = Self::parse_id(job_id)?;

        let outcome = self.store.update(&job_id, &mut |record| {
            let mut next = record.clone();
            match record.state {
                JobState::Pending => next.cancel().ok()?,
                JobState::Running => next.request_cancel().ok()?,
                _ => return None,
            }
            Some(next)
        })?;

        let state = outcome.record().state;
        if outcome.is_updated() {
            info!(job_id = %job_id, state = %state, "cancellation recorded");
        }
        Ok(CancelAck {
            job_id,
            accepted: true,
            state,
        })
    }
}
