use serde::Serialize;
use thiserror::Error;

use mediagraph_infra::JobError;

/// A [`JobError`] classified for the HTTP layer.
///
/// Serialises as `{"error": code, "message": ...}`; the status travels separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    #[serde(skip)]
    pub http_status: u16,
    #[serde(rename = "error")]
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(http_status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            http_status,
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(400, "validation_error", message)
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        self.http_status == 503
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(msg) => ApiError::validation(msg),
            JobError::NotFound(id) => ApiError::new(404, "not_found", format!("job {id} not found")),
            JobError::QueueUnavailable(msg) => ApiError::new(503, "queue_unavailable", msg),
            JobError::StoreUnavailable(msg) => ApiError::new(503, "store_unavailable", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_errors_map_to_http_statuses() {
        let cases = [
            (JobError::Validation("bad".into()), 400, "validation_error"),
            (JobError::NotFound("x".into()), 404, "not_found"),
            (JobError::QueueUnavailable("down".into()), 503, "queue_unavailable"),
            (JobError::StoreUnavailable("down".into()), 503, "store_unavailable"),
        ];

        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.http_status, status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn body_hides_http_status() {
        let body = serde_json::to_value(ApiError::validation("input too large")).unwrap();
        assert_eq!(body, serde_json::json!({"error": "validation_error", "message": "input too large"}));
    }
}
