//! `mediagraph-core` — job domain building blocks.
//!
//! This crate contains the **pure domain** of the job system (no infrastructure
//! concerns): identifiers, the job record and its state machine, and input
//! validation.

pub mod error;
pub mod id;
pub mod input;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use input::{RetrievalQuery, validate_input};
pub use job::{ErrorDescriptor, ErrorKind, JobDescriptor, JobKind, JobRecord, JobState};
