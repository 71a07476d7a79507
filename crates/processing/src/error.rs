use thiserror::Error;

use mediagraph_core::{ErrorDescriptor, ErrorKind};

/// Why a running processor was told to stop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum Interrupted {
    /// The job's owner asked for cancellation.
    #[error("cancellation requested")]
    Cancelled,

    /// The job ran past its soft time limit.
    #[error("soft time limit exceeded")]
    TimedOut,
}

/// Failure raised by an external processing function.
///
/// Never fatal to the worker: it is classified into an [`ErrorDescriptor`] and
/// stored on the job record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("processing failed: {0}")]
    Failed(String),

    #[error("interrupted: {0}")]
    Interrupted(#[from] Interrupted),
}

impl ProcessingError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// The descriptor recorded on a FAILED job.
    ///
    /// Cancellation is not a failure; callers handle it before classifying.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        match self {
            ProcessingError::InvalidInput(msg) => ErrorDescriptor::new(ErrorKind::InvalidInput, msg.clone()),
            ProcessingError::Failed(msg) => ErrorDescriptor::new(ErrorKind::ProcessingFailed, msg.clone()),
            ProcessingError::Interrupted(Interrupted::TimedOut) => {
                ErrorDescriptor::new(ErrorKind::Timeout, "soft time limit exceeded")
            }
            ProcessingError::Interrupted(Interrupted::Cancelled) => {
                ErrorDescriptor::new(ErrorKind::Internal, "cancelled")
            }
        }
    }
}
