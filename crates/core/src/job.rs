//! The job record and its lifecycle state machine.
//!
//! ```text
//! PENDING ──claim──► RUNNING ──succeed/fail──► SUCCEEDED | FAILED
//!    │                  │
//!    │             request_cancel
//!    │                  ▼
//!    │           CANCEL_REQUESTED ──cancel──► CANCELLED
//!    │                  └──succeed/fail──► SUCCEEDED | FAILED   (completion wins)
//!    └──────────cancel──────────────────────► CANCELLED
//! ```
//!
//! All mutation goes through the transition methods on [`JobRecord`]; they reject
//! moves the diagram does not allow and keep `output`/`error` consistent with the
//! state. Terminal states are never left.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Which external processing function a job runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobKind {
    /// Scene-graph construction from media metadata.
    #[serde(rename = "META_TO_SCENEGRAPH")]
    MetaToSceneGraph,
    /// Scene-graph retrieval/search for a text query.
    #[serde(rename = "RETRIEVE_SCENEGRAPH")]
    RetrieveSceneGraph,
}

impl JobKind {
    /// Every kind, for exhaustive registration checks.
    pub const ALL: [JobKind; 2] = [JobKind::MetaToSceneGraph, JobKind::RetrieveSceneGraph];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::MetaToSceneGraph => "META_TO_SCENEGRAPH",
            JobKind::RetrieveSceneGraph => "RETRIEVE_SCENEGRAPH",
        }
    }

    /// Prefix used when minting job ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            JobKind::MetaToSceneGraph => "meta2graph",
            JobKind::RetrieveSceneGraph => "retrieval_graph",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job kind '{s}'")))
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    CancelRequested,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::CancelRequested => "CANCEL_REQUESTED",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    /// Numeric status code understood by existing clients.
    pub fn status_code(&self) -> u16 {
        match self {
            JobState::Pending => 200,
            JobState::Running | JobState::CancelRequested => 201,
            JobState::Succeeded => 202,
            JobState::Failed => 203,
            JobState::Cancelled => 204,
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// RUNNING → RUNNING is the re-claim of a redelivered job.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, CancelRequested)
                | (Running, Succeeded)
                | (Running, Failed)
                | (CancelRequested, Cancelled)
                | (CancelRequested, Succeeded)
                | (CancelRequested, Failed)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a job failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The processor rejected the input.
    InvalidInput,
    /// The processor ran and reported a failure.
    ProcessingFailed,
    /// The soft time limit was exceeded.
    Timeout,
    /// The processor crashed (panic or unexpected condition).
    Internal,
    /// The job was delivered more times than the worker pool allows.
    RedeliveryExhausted,
    /// The job could not be handed to the work queue.
    QueueUnavailable,
}

/// User-visible error attached to a FAILED job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Minimal payload placed on the work queue.
///
/// Carries only what a worker needs to find the record; the record, not the
/// descriptor, is authoritative for state and input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
}

impl JobDescriptor {
    pub fn for_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            kind: record.kind,
            enqueued_at: Utc::now(),
        }
    }
}

/// One unit of submitted work and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub input: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// Percentage in [0, 100].
    #[serde(default)]
    pub progress: f32,
    /// Number of claims so far; the current holder's fencing token.
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// How long the record stays queryable after its last write.
    pub ttl: Duration,
}

impl JobRecord {
    /// Create a PENDING record with a fresh id.
    pub fn new(kind: JobKind, input: JsonValue, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(kind),
            kind,
            state: JobState::Pending,
            input,
            output: None,
            error: None,
            progress: 0.0,
            attempt: 0,
            created_at: now,
            updated_at: now,
            ttl,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, next: JobState) -> DomainResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.state, next));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// PENDING → RUNNING. Returns the claim's fencing token.
    pub fn claim(&mut self) -> DomainResult<u32> {
        if self.state != JobState::Pending {
            return Err(DomainError::invalid_transition(self.state, JobState::Running));
        }
        self.transition(JobState::Running)?;
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// RUNNING → RUNNING for a redelivered job whose previous holder went away.
    ///
    /// Bumps the fencing token so a late write from the previous holder is rejected.
    pub fn reclaim(&mut self) -> DomainResult<u32> {
        if self.state != JobState::Running {
            return Err(DomainError::invalid_transition(self.state, JobState::Running));
        }
        self.transition(JobState::Running)?;
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// RUNNING → CANCEL_REQUESTED.
    pub fn request_cancel(&mut self) -> DomainResult<()> {
        self.transition(JobState::CancelRequested)
    }

    /// PENDING | CANCEL_REQUESTED → CANCELLED.
    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(JobState::Cancelled)?;
        self.output = None;
        self.error = None;
        Ok(())
    }

    /// RUNNING | CANCEL_REQUESTED → SUCCEEDED.
    pub fn succeed(&mut self, output: JsonValue) -> DomainResult<()> {
        self.transition(JobState::Succeeded)?;
        self.output = Some(output);
        self.error = None;
        self.progress = 100.0;
        Ok(())
    }

    /// PENDING | RUNNING | CANCEL_REQUESTED → FAILED.
    pub fn fail(&mut self, error: ErrorDescriptor) -> DomainResult<()> {
        self.transition(JobState::Failed)?;
        self.output = None;
        self.error = Some(error);
        Ok(())
    }

    /// Record progress reported by a running processor.
    pub fn report_progress(&mut self, percent: f32) -> DomainResult<()> {
        if !matches!(self.state, JobState::Running | JobState::CancelRequested) {
            return Err(DomainError::validation(format!(
                "progress reported for job in state {}",
                self.state
            )));
        }
        self.progress = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { self.progress };
        Ok(())
    }
}
