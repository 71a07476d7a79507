//! API boundary: request/response DTOs, error classification, and the job façade
//! an HTTP layer calls into.

pub mod dto;
pub mod errors;
pub mod jobs;

pub use dto::{CancelResponse, StatusView, SubmitRequest, SubmitResponse};
pub use errors::ApiError;
pub use jobs::JobApi;
