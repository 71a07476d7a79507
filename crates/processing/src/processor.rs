use serde_json::Value as JsonValue;

use mediagraph_core::JobKind;

use crate::error::{Interrupted, ProcessingError};

/// Cooperative cancellation point handed to a running processor.
///
/// ## Contract
///
/// A processor that can be interrupted calls [`Checkpoint::check`] between units
/// of work, and at least every few seconds during long stretches. When `check`
/// returns `Err`, the processor must stop and propagate it (`?`) without
/// producing output. A processor that never calls `check` is treated as
/// non-interruptible: cancellation then only takes effect before it starts.
///
/// `check` is cheap to call in a tight loop; implementations throttle reads of
/// the backing store.
pub trait Checkpoint {
    fn check(&self) -> Result<(), Interrupted>;

    /// Report completion percentage in [0, 100]. Best effort.
    fn report_progress(&self, percent: f32);
}

/// The external processing function for one job kind.
///
/// Must be safe to run more than once for the same input: a worker crash after
/// claiming a job leads to redelivery and a second run.
pub trait Processor: Send + Sync + 'static {
    /// The kind this processor serves.
    fn kind(&self) -> JobKind;

    /// Turn a job input into its output.
    fn process(&self, input: &JsonValue, checkpoint: &dyn Checkpoint) -> Result<JsonValue, ProcessingError>;
}

/// Checkpoint that never interrupts and discards progress.
///
/// For running processors outside the worker pool (tools, tests).
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopCheckpoint;

impl Checkpoint for NoopCheckpoint {
    fn check(&self) -> Result<(), Interrupted> {
        Ok(())
    }

    fn report_progress(&self, _percent: f32) {}
}

/// Processor backed by a closure.
pub struct FnProcessor<F> {
    kind: JobKind,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&JsonValue, &dyn Checkpoint) -> Result<JsonValue, ProcessingError> + Send + Sync + 'static,
{
    pub fn new(kind: JobKind, f: F) -> Self {
        Self { kind, f }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&JsonValue, &dyn Checkpoint) -> Result<JsonValue, ProcessingError> + Send + Sync + 'static,
{
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn process(&self, input: &JsonValue, checkpoint: &dyn Checkpoint) -> Result<JsonValue, ProcessingError> {
        (self.f)(input, checkpoint)
    }
}

impl<F> core::fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnProcessor").field("kind", &self.kind).finish()
    }
}
