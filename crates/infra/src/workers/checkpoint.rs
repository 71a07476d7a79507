use std::cell::Cell;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use mediagraph_core::{JobId, JobState};
use mediagraph_processing::{Checkpoint, Interrupted};

use crate::queue::{AckHandle, WorkQueue};
use crate::store::{ResultStore, StoreError};

/// Checkpoint bound to one claimed job.
///
/// Every `check` past the poll interval re-reads the record and extends the
/// message's visibility. Anything other than our own claim still RUNNING stops
/// the processor: a cancel request, a newer claim, a terminal state, or a
/// vanished record. Once interrupted, every later `check` returns the same.
pub struct JobCheckpoint<'a, S: ?Sized, Q: ?Sized> {
    store: &'a S,
    queue: &'a Q,
    job_id: &'a JobId,
    handle: &'a AckHandle,
    epoch: u32,
    started: Instant,
    soft_time_limit: Option<Duration>,
    interval: Duration,
    last_poll: Cell<Option<Instant>>,
    last_progress_write: Cell<Option<Instant>>,
    interrupted: Cell<Option<Interrupted>>,
}

impl<'a, S, Q> JobCheckpoint<'a, S, Q>
where
    S: ResultStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    pub fn new(
        store: &'a S,
        queue: &'a Q,
        job_id: &'a JobId,
        handle: &'a AckHandle,
        epoch: u32,
    ) -> Self {
        Self {
            store,
            queue,
            job_id,
            handle,
            epoch,
            started: Instant::now(),
            soft_time_limit: None,
            interval: Duration::from_secs(1),
            last_poll: Cell::new(None),
            last_progress_write: Cell::new(None),
            interrupted: Cell::new(None),
        }
    }

    pub fn with_soft_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.soft_time_limit = limit;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Why the processor was stopped, if it was.
    pub fn interrupted(&self) -> Option<Interrupted> {
        self.interrupted.get()
    }

    fn stop(&self, reason: Interrupted) -> Result<(), Interrupted> {
        self.interrupted.set(Some(reason));
        Err(reason)
    }

    fn due(last: &Cell<Option<Instant>>, interval: Duration, now: Instant) -> bool {
        match last.get() {
            Some(at) if now.duration_since(at) < interval => false,
            _ => {
                last.set(Some(now));
                true
            }
        }
    }

    fn poll_record(&self) -> Result<(), Interrupted> {
        if let Err(e) = self.queue.extend(self.handle) {
            warn!(job_id = %self.job_id, error = %e, "failed to extend message visibility");
        }

        match self.store.get(self.job_id) {
            Ok(record) if record.attempt != self.epoch => {
                debug!(job_id = %self.job_id, epoch = self.epoch, current = record.attempt, "claim superseded");
                self.stop(Interrupted::Cancelled)
            }
            Ok(record) => match record.state {
                JobState::Running => Ok(()),
                JobState::CancelRequested => {
                    debug!(job_id = %self.job_id, "cancellation observed");
                    self.stop(Interrupted::Cancelled)
                }
                _ => self.stop(Interrupted::Cancelled),
            },
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %self.job_id, "job record vanished while running");
                self.stop(Interrupted::Cancelled)
            }
            Err(e) => {
                // Keep going; the next poll may reach the store.
                warn!(job_id = %self.job_id, error = %e, "checkpoint could not read job record");
                Ok(())
            }
        }
    }
}

impl<S, Q> Checkpoint for JobCheckpoint<'_, S, Q>
where
    S: ResultStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    fn check(&self) -> Result<(), Interrupted> {
        if let Some(reason) = self.interrupted.get() {
            return Err(reason);
        }

        let now = Instant::now();
        if let Some(limit) = self.soft_time_limit {
            if now.duration_since(self.started) >= limit {
                return self.stop(Interrupted::TimedOut);
            }
        }

        if !Self::due(&self.last_poll, self.interval, now) {
            return Ok(());
        }
        self.poll_record()
    }

    fn report_progress(&self, percent: f32) {
        if self.interrupted.get().is_some()
            || !Self::due(&self.last_progress_write, self.interval, Instant::now())
        {
            return;
        }

        let epoch = self.epoch;
        let result = self.store.update(self.job_id, &mut |record| {
            if record.attempt != epoch {
                return None;
            }
            let mut next = record.clone();
            next.report_progress(percent).ok()?;
            Some(next)
        });

        if let Err(e) = result {
            warn!(job_id = %self.job_id, error = %e, "failed to record progress");
        }
    }
}
