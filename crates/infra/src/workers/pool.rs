//! Worker pool: pull loops that drive claimed jobs to a terminal state.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, info_span, warn};

use mediagraph_core::{ErrorDescriptor, ErrorKind, JobRecord, JobState};
use mediagraph_processing::{Interrupted, ProcessingError, ProcessorRegistry};

use crate::queue::{AckHandle, Delivery, QueueError, WorkQueue};
use crate::store::{ResultStore, StoreError};
use crate::workers::checkpoint::JobCheckpoint;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name prefix and log field
    pub name: String,
    /// Number of worker threads
    pub concurrency: usize,
    /// How long one dequeue waits for a message
    pub poll_interval: Duration,
    /// Deliveries after which a job is failed instead of run again
    pub max_deliveries: u32,
    /// Processors are interrupted with `TimedOut` after this long
    pub soft_time_limit: Option<Duration>,
    /// Minimum spacing of checkpoint reads and progress writes
    pub checkpoint_interval: Duration,
    /// How often a held delivery's visibility is extended while its processor runs;
    /// keep it well under the queue's visibility timeout
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "mediagraph-worker".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            max_deliveries: 5,
            soft_time_limit: Some(Duration::from_secs(25 * 60)),
            checkpoint_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_soft_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.soft_time_limit = limit;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Deliveries acked without running (terminal, unknown, or held elsewhere)
    pub jobs_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What handling one delivery came to.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Succeeded,
    Failed(ErrorKind),
    Cancelled,
    /// Acked without running: terminal already, unknown, or owned by a live claim.
    Skipped,
    /// A newer claim took over while this one ran; the result was discarded.
    Superseded,
    /// The store could not be reached; the message was left for redelivery.
    Deferred,
}

/// How a processor run ended, before it is written back.
enum Finish {
    Output(JsonValue),
    Cancelled,
    Failed(ErrorDescriptor),
}

/// What the claim step decided.
#[derive(Clone, Copy)]
enum Claim {
    Run(u32),
    Cancelled,
    Skip,
}

/// Extend `handle` every `interval` until `done` fires or disconnects.
fn heartbeat<Q: WorkQueue + ?Sized>(queue: &Q, handle: &AckHandle, interval: Duration, done: mpsc::Receiver<()>) {
    while let Err(RecvTimeoutError::Timeout) = done.recv_timeout(interval) {
        match queue.extend(handle) {
            Ok(()) => {}
            Err(QueueError::UnknownHandle(_)) => {
                debug!("delivery no longer held, heartbeat stopped");
                return;
            }
            Err(e) => warn!(error = %e, "heartbeat could not extend delivery"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// One pull-loop participant. Exposed for driving deliveries by hand.
pub struct Worker<S: ?Sized, Q: ?Sized> {
    store: Arc<S>,
    queue: Arc<Q>,
    registry: Arc<ProcessorRegistry>,
    config: WorkerConfig,
}

impl<S, Q> Worker<S, Q>
where
    S: ResultStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, registry: Arc<ProcessorRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            queue,
            registry,
            config,
        }
    }

    /// Dequeue and handle at most one message.
    pub fn run_once(&self, wait: Duration) -> Result<Option<DeliveryOutcome>, QueueError> {
        match self.queue.dequeue(wait)? {
            Some(delivery) => Ok(Some(self.handle(delivery))),
            None => Ok(None),
        }
    }

    fn settle(&self, delivery: &Delivery, outcome: DeliveryOutcome) -> DeliveryOutcome {
        if let Err(e) = self.queue.ack(&delivery.handle) {
            // The message comes back; the record already says what happened.
            warn!(job_id = %delivery.descriptor.job_id, error = %e, "failed to ack delivery");
        }
        outcome
    }

    /// Drive one delivery as far as it goes.
    pub fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        let span = info_span!(
            "job",
            job_id = %delivery.descriptor.job_id,
            kind = %delivery.descriptor.kind,
            delivery = delivery.delivery_count
        );
        let _guard = span.enter();

        if delivery.delivery_count > self.config.max_deliveries {
            return self.give_up(&delivery);
        }

        let job_id = &delivery.descriptor.job_id;
        let redelivered = delivery.is_redelivery();
        let mut claim = Claim::Skip;

        let claimed = self.store.update(job_id, &mut |record| {
            let mut next = record.clone();
            match record.state {
                JobState::Pending => {
                    claim = Claim::Run(next.claim().ok()?);
                    Some(next)
                }
                // The previous holder stopped extending the message; take over.
                JobState::Running if redelivered => {
                    claim = Claim::Run(next.reclaim().ok()?);
                    Some(next)
                }
                JobState::CancelRequested => {
                    next.cancel().ok()?;
                    claim = Claim::Cancelled;
                    Some(next)
                }
                _ => {
                    claim = Claim::Skip;
                    None
                }
            }
        });

        let record = match claimed {
            Ok(outcome) => outcome.into_record(),
            Err(StoreError::NotFound(_)) => {
                warn!("job record missing or expired, dropping message");
                return self.settle(&delivery, DeliveryOutcome::Skipped);
            }
            Err(e) => {
                error!(error = %e, "could not claim job, leaving message for redelivery");
                return DeliveryOutcome::Deferred;
            }
        };

        match claim {
            Claim::Skip => {
                debug!(state = %record.state, "nothing to run");
                self.settle(&delivery, DeliveryOutcome::Skipped)
            }
            Claim::Cancelled => {
                info!("cancelled before start");
                self.settle(&delivery, DeliveryOutcome::Cancelled)
            }
            Claim::Run(epoch) => self.run(&delivery, record, epoch),
        }
    }

    fn give_up(&self, delivery: &Delivery) -> DeliveryOutcome {
        let limit = self.config.max_deliveries;
        let failed = self.store.update(&delivery.descriptor.job_id, &mut |record| {
            let mut next = record.clone();
            next.fail(ErrorDescriptor::new(
                ErrorKind::RedeliveryExhausted,
                format!("job was delivered more than {limit} times without completing"),
            ))
            .ok()?;
            Some(next)
        });

        match failed {
            Ok(outcome) if outcome.is_updated() => {
                warn!(limit, "redelivery limit reached, job failed");
                self.settle(delivery, DeliveryOutcome::Failed(ErrorKind::RedeliveryExhausted))
            }
            Ok(_) | Err(StoreError::NotFound(_)) => self.settle(delivery, DeliveryOutcome::Skipped),
            Err(e) => {
                error!(error = %e, "could not fail exhausted job");
                DeliveryOutcome::Deferred
            }
        }
    }

    fn run(&self, delivery: &Delivery, record: JobRecord, epoch: u32) -> DeliveryOutcome {
        let job_id = &record.job_id;
        info!(epoch, "job started");
        let started = Instant::now();

        let checkpoint = JobCheckpoint::new(&*self.store, &*self.queue, job_id, &delivery.handle, epoch)
            .with_soft_time_limit(self.config.soft_time_limit)
            .with_interval(self.config.checkpoint_interval);
        let processor = self.registry.get(record.kind);

        let (done, done_rx) = mpsc::channel::<()>();
        let result = thread::scope(|s| {
            let queue = &*self.queue;
            let handle = &delivery.handle;
            let interval = self.config.heartbeat_interval;
            let spawned = thread::Builder::new()
                .name(format!("{}-heartbeat", self.config.name))
                .spawn_scoped(s, move || heartbeat(queue, handle, interval, done_rx));
            if let Err(e) = spawned {
                warn!(error = %e, "could not start heartbeat, relying on checkpoints");
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&record.input, &checkpoint)));
            drop(done);
            result
        });

        let finish = match result {
            Ok(Ok(output)) => Finish::Output(output),
            Ok(Err(ProcessingError::Interrupted(Interrupted::Cancelled))) => Finish::Cancelled,
            Ok(Err(e)) => Finish::Failed(e.to_descriptor()),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(panic = %msg, "processor panicked");
                Finish::Failed(ErrorDescriptor::new(ErrorKind::Internal, format!("processor crashed: {msg}")))
            }
        };

        let mut superseded = false;
        let written = self.store.update(job_id, &mut |current| {
            superseded = current.attempt != epoch || current.is_terminal();
            if superseded {
                return None;
            }
            let mut next = current.clone();
            match &finish {
                // Completion wins over a cancel request that arrived meanwhile.
                Finish::Output(output) => next.succeed(output.clone()).ok()?,
                Finish::Cancelled if current.state == JobState::CancelRequested => next.cancel().ok()?,
                Finish::Cancelled => next
                    .fail(ErrorDescriptor::new(
                        ErrorKind::Internal,
                        "processor stopped without a cancellation request",
                    ))
                    .ok()?,
                Finish::Failed(descriptor) => next.fail(descriptor.clone()).ok()?,
            }
            Some(next)
        });

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match written {
            Ok(outcome) if outcome.is_updated() => {
                let record = outcome.into_record();
                let result = match record.state {
                    JobState::Succeeded => DeliveryOutcome::Succeeded,
                    JobState::Cancelled => DeliveryOutcome::Cancelled,
                    _ => DeliveryOutcome::Failed(
                        record.error.as_ref().map_or(ErrorKind::Internal, |e| e.kind),
                    ),
                };
                info!(state = %record.state, elapsed_ms, "job finished");
                self.settle(delivery, result)
            }
            Ok(_) if superseded => {
                // The newer holder owns the message now.
                info!(elapsed_ms, "result discarded, claim superseded");
                DeliveryOutcome::Superseded
            }
            Ok(_) => {
                warn!("job record refused final transition");
                self.settle(delivery, DeliveryOutcome::Skipped)
            }
            Err(StoreError::NotFound(_)) => {
                warn!(elapsed_ms, "job record expired while running");
                self.settle(delivery, DeliveryOutcome::Skipped)
            }
            Err(e) => {
                error!(error = %e, "could not persist job result, leaving message for redelivery");
                DeliveryOutcome::Deferred
            }
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop taking new messages, let in-flight jobs finish, and join every thread.
    ///
    /// Returns how many worker threads had died from a panic.
    pub fn shutdown(mut self) -> usize {
        self.shutdown.store(true, Ordering::Release);
        join_all(self.joins.drain(..))
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Fixed-size pool of worker threads sharing one store and queue.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` threads named `<name>-<n>`.
    pub fn spawn<S, Q>(
        config: WorkerConfig,
        store: Arc<S>,
        queue: Arc<Q>,
        registry: Arc<ProcessorRegistry>,
    ) -> io::Result<WorkerPoolHandle>
    where
        S: ResultStore + ?Sized + 'static,
        Q: WorkQueue + ?Sized + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut joins = Vec::with_capacity(config.concurrency);

        for n in 0..config.concurrency.max(1) {
            let name = format!("{}-{}", config.name, n);
            let worker = Worker::new(store.clone(), queue.clone(), registry.clone(), config.clone());
            let flag = shutdown.clone();
            let worker_stats = stats.clone();

            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, &worker, &flag, &worker_stats));

            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    join_all(joins);
                    return Err(e);
                }
            }
        }

        info!(pool = %config.name, workers = joins.len(), "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

fn join_all(joins: impl IntoIterator<Item = thread::JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for join in joins {
        let name = join.thread().name().unwrap_or("worker").to_string();
        if let Err(payload) = join.join() {
            warn!(worker = %name, panic = %panic_message(payload.as_ref()), "worker thread panicked");
            panicked += 1;
        }
    }
    panicked
}

fn record_outcome(stats: &Mutex<WorkerStats>, outcome: &DeliveryOutcome) {
    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
    match outcome {
        DeliveryOutcome::Succeeded => s.jobs_succeeded += 1,
        DeliveryOutcome::Failed(_) => s.jobs_failed += 1,
        DeliveryOutcome::Cancelled => s.jobs_cancelled += 1,
        DeliveryOutcome::Skipped | DeliveryOutcome::Superseded => s.jobs_skipped += 1,
        DeliveryOutcome::Deferred => return,
    }
    s.jobs_processed += 1;
}

fn worker_loop<S, Q>(name: &str, worker: &Worker<S, Q>, shutdown: &AtomicBool, stats: &Mutex<WorkerStats>)
where
    S: ResultStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    info!(worker = name, "worker started");

    while !shutdown.load(Ordering::Acquire) {
        let delivery = match worker.queue.dequeue(worker.config.poll_interval) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!(worker = name, error = %e, "failed to dequeue");
                thread::sleep(worker.config.poll_interval);
                continue;
            }
        };

        stats.lock().unwrap_or_else(PoisonError::into_inner).current_running += 1;
        let outcome = worker.handle(delivery);
        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.current_running = s.current_running.saturating_sub(1);
        }
        record_outcome(stats, &outcome);

        if outcome == DeliveryOutcome::Deferred {
            // Store trouble; don't spin on the same message.
            thread::sleep(worker.config.poll_interval);
        }
    }

    info!(worker = name, "worker stopped");
}
