use serde_json::Value as JsonValue;
use tracing::debug;

use mediagraph_core::JobKind;
use mediagraph_infra::{LifecycleManager, ResultStore, WorkQueue};

use crate::dto::{CancelResponse, StatusView, SubmitRequest, SubmitResponse};
use crate::errors::ApiError;

/// Job endpoints over a [`LifecycleManager`], speaking the boundary DTOs.
#[derive(Debug, Clone)]
pub struct JobApi<S, Q> {
    manager: LifecycleManager<S, Q>,
}

impl<S, Q> JobApi<S, Q>
where
    S: ResultStore,
    Q: WorkQueue,
{
    pub fn new(manager: LifecycleManager<S, Q>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &LifecycleManager<S, Q> {
        &self.manager
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ApiError> {
        let kind: JobKind = request
            .kind
            .parse()
            .map_err(|_| ApiError::validation(format!("unknown job kind '{}'", request.kind)))?;
        self.submit_kind(kind, request.input)
    }

    pub fn submit_kind(&self, kind: JobKind, input: JsonValue) -> Result<SubmitResponse, ApiError> {
        let job_id = self.manager.submit(kind, input)?;
        Ok(SubmitResponse::pending(job_id))
    }

    pub fn status(&self, job_id: &str) -> Result<StatusView, ApiError> {
        let record = self.manager.get_status(job_id)?;
        debug!(job_id, state = %record.state, "status read");
        Ok(record.into())
    }

    pub fn cancel(&self, job_id: &str) -> Result<CancelResponse, ApiError> {
        Ok(self.manager.cancel(job_id)?.into())
    }
}
