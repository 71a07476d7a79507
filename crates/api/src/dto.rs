use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use mediagraph_core::{ErrorDescriptor, JobId, JobKind, JobRecord, JobState};
use mediagraph_infra::CancelAck;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    /// `META_TO_SCENEGRAPH` or `RETRIEVE_SCENEGRAPH`
    pub kind: String,
    pub input: JsonValue,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: u16,
    pub message: String,
}

impl SubmitResponse {
    /// A freshly submitted job is always PENDING.
    pub fn pending(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobState::Pending.status_code(),
            message: JobState::Pending.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub status: u16,
    pub message: String,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for StatusView {
    fn from(record: JobRecord) -> Self {
        Self {
            status: record.state.status_code(),
            message: record.state.to_string(),
            job_id: record.job_id,
            kind: record.kind,
            state: record.state,
            progress: record.progress,
            output: record.output,
            error: record.error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResponse {
    pub accepted: bool,
    pub state: JobState,
    pub status: u16,
    pub message: String,
}

impl From<CancelAck> for CancelResponse {
    fn from(ack: CancelAck) -> Self {
        Self {
            accepted: ack.accepted,
            state: ack.state,
            status: ack.state.status_code(),
            message: ack.state.to_string(),
        }
    }
}
