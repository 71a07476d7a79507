//! Integration tests for the full job pipeline.
//!
//! Tests: submit → ResultStore + WorkQueue → Worker → Processor → ResultStore
//!
//! Verifies:
//! - Jobs reach exactly one terminal state, even across crashes and duplicates
//! - Cancellation before and during processing
//! - A result that completes wins over a late cancel request
//! - Expired records read as not found

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use mediagraph_core::{ErrorKind, JobDescriptor, JobKind, JobRecord, JobState};
    use mediagraph_processing::{FnProcessor, ProcessingError, Processor, ProcessorRegistry};

    use crate::lifecycle::{JobError, LifecycleConfig, LifecycleManager};
    use crate::queue::{InMemoryWorkQueue, WorkQueue};
    use crate::store::{InMemoryResultStore, ResultStore};
    use crate::workers::{DeliveryOutcome, Worker, WorkerConfig, WorkerPool};

    type Manager = LifecycleManager<Arc<InMemoryResultStore>, Arc<InMemoryWorkQueue>>;

    struct Harness {
        manager: Manager,
        store: Arc<InMemoryResultStore>,
        queue: Arc<InMemoryWorkQueue>,
    }

    fn harness() -> Harness {
        harness_with(LifecycleConfig::default(), Duration::from_millis(50))
    }

    fn harness_with(config: LifecycleConfig, visibility_timeout: Duration) -> Harness {
        let store = InMemoryResultStore::arc();
        let queue = Arc::new(InMemoryWorkQueue::new(visibility_timeout));
        let manager = LifecycleManager::with_config(store.clone(), queue.clone(), config);
        Harness { manager, store, queue }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_name("test-worker")
            .with_poll_interval(Duration::from_millis(10))
            .with_checkpoint_interval(Duration::ZERO)
    }

    fn registry(meta: impl Processor) -> Arc<ProcessorRegistry> {
        let retrieve = FnProcessor::new(JobKind::RetrieveSceneGraph, |input, _| {
            if input["query"] == "nothing" {
                return Err(ProcessingError::failed("no matching scene graphs"));
            }
            Ok(json!({"matches": [input["query"].clone()]}))
        });
        Arc::new(ProcessorRegistry::builder().register(meta).register(retrieve).build().unwrap())
    }

    fn counting_registry(runs: Arc<AtomicUsize>, delay: Duration) -> Arc<ProcessorRegistry> {
        registry(FnProcessor::new(JobKind::MetaToSceneGraph, move |input, _| {
            runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(delay);
            Ok(json!({"scene_graph": input["meta"].clone()}))
        }))
    }

    impl Harness {
        fn worker(&self, registry: Arc<ProcessorRegistry>) -> Worker<InMemoryResultStore, InMemoryWorkQueue> {
            Worker::new(self.store.clone(), self.queue.clone(), registry, worker_config())
        }

        fn wait_for_terminal(&self, job_id: &str, timeout: Duration) -> JobRecord {
            let deadline = Instant::now() + timeout;
            loop {
                let record = self.manager.get_status(job_id).unwrap();
                if record.is_terminal() || Instant::now() >= deadline {
                    return record;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    #[test]
    fn submitted_job_is_pending_and_queued() {
        let h = harness();
        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();

        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.state.status_code(), 200);
        assert_eq!(record.attempt, 0);
        assert_eq!(h.queue.ready_len(), 1);
    }

    #[test]
    fn worker_drives_job_to_success() {
        let h = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = h.worker(counting_registry(runs.clone(), Duration::ZERO));

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();
        assert_eq!(worker.run_once(Duration::ZERO).unwrap(), Some(DeliveryOutcome::Succeeded));

        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.state.status_code(), 202);
        assert_eq!(record.output, Some(json!({"scene_graph": "X"})));
        assert!(record.error.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.in_flight_len(), 0);
    }

    #[test]
    fn processor_failure_is_classified() {
        let h = harness();
        let worker = h.worker(counting_registry(Arc::new(AtomicUsize::new(0)), Duration::ZERO));

        let job_id = h.manager.submit(JobKind::RetrieveSceneGraph, json!({"query": "nothing"})).unwrap();
        worker.run_once(Duration::ZERO).unwrap();

        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.output.is_none());
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProcessingFailed);
        assert_eq!(error.message, "no matching scene graphs");
    }

    #[test]
    fn duplicate_deliveries_run_processor_once() {
        let h = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(runs.clone(), Duration::from_millis(20));
        let first = h.worker(registry.clone());
        let second = h.worker(registry);

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();
        // Same descriptor handed out twice, as an at-least-once broker may do.
        let record = h.manager.get_status(job_id.as_str()).unwrap();
        h.queue.enqueue(&JobDescriptor::for_record(&record)).unwrap();

        let outcomes = thread::scope(|s| {
            let a = s.spawn(|| first.run_once(Duration::from_millis(100)).unwrap());
            let b = s.spawn(|| second.run_once(Duration::from_millis(100)).unwrap());
            [a.join().unwrap(), b.join().unwrap()]
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(outcomes.contains(&Some(DeliveryOutcome::Succeeded)));
        assert!(outcomes.contains(&Some(DeliveryOutcome::Skipped)));
        assert_eq!(h.manager.get_status(job_id.as_str()).unwrap().attempt, 1);
    }

    #[test]
    fn cancel_before_start_never_runs_processor() {
        let h = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = h.worker(counting_registry(runs.clone(), Duration::ZERO));

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();
        let ack = h.manager.cancel(job_id.as_str()).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.state, JobState::Cancelled);

        assert_eq!(worker.run_once(Duration::ZERO).unwrap(), Some(DeliveryOutcome::Skipped));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(record.state.status_code(), 204);
        assert!(record.output.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn cancel_is_idempotent() {
        let h = harness();
        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();

        let first = h.manager.cancel(job_id.as_str()).unwrap();
        let updated_at = h.manager.get_status(job_id.as_str()).unwrap().updated_at;
        let second = h.manager.cancel(job_id.as_str()).unwrap();

        assert_eq!(first, second);
        assert_eq!(h.manager.get_status(job_id.as_str()).unwrap().updated_at, updated_at);
    }

    #[test]
    fn running_job_stops_at_checkpoint_after_cancel() {
        let h = harness();
        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let worker = h.worker(registry(FnProcessor::new(JobKind::MetaToSceneGraph, move |_, checkpoint| {
            let _ = started_tx.lock().unwrap().send(());
            loop {
                checkpoint.check()?;
                thread::sleep(Duration::from_millis(2));
            }
        })));

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();

        let outcome = thread::scope(|s| {
            let run = s.spawn(|| worker.run_once(Duration::ZERO).unwrap());
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

            let ack = h.manager.cancel(job_id.as_str()).unwrap();
            assert_eq!(ack.state, JobState::CancelRequested);
            assert_eq!(ack.state.status_code(), 201);
            run.join().unwrap()
        });

        assert_eq!(outcome, Some(DeliveryOutcome::Cancelled));
        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert!(record.output.is_none());
    }

    #[test]
    fn completion_wins_over_late_cancel_request() {
        let h = harness();
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let go_rx = Mutex::new(go_rx);
        // Never consults the checkpoint, so it cannot observe the request.
        let worker = h.worker(registry(FnProcessor::new(JobKind::MetaToSceneGraph, move |_, _| {
            let _ = started_tx.lock().unwrap().send(());
            let _ = go_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(json!({"scene_graph": "done"}))
        })));

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();

        let outcome = thread::scope(|s| {
            let run = s.spawn(|| worker.run_once(Duration::ZERO).unwrap());
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(h.manager.cancel(job_id.as_str()).unwrap().state, JobState::CancelRequested);
            go_tx.send(()).unwrap();
            run.join().unwrap()
        });

        assert_eq!(outcome, Some(DeliveryOutcome::Succeeded));
        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.output, Some(json!({"scene_graph": "done"})));

        // Terminal now; a further cancel changes nothing.
        assert_eq!(h.manager.cancel(job_id.as_str()).unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn crashed_worker_job_is_redelivered_and_finished_once() {
        let h = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = h.worker(counting_registry(runs.clone(), Duration::ZERO));

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();

        // A worker claims the job and dies without acking or extending.
        let lost = h.queue.dequeue(Duration::ZERO).unwrap().unwrap();
        h.store
            .update(&job_id, &mut |r| {
                let mut next = r.clone();
                next.claim().ok()?;
                Some(next)
            })
            .unwrap();
        drop(lost);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(worker.run_once(Duration::ZERO).unwrap(), Some(DeliveryOutcome::Succeeded));

        let record = h.manager.get_status(job_id.as_str()).unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.attempt, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Nothing left to deliver.
        assert_eq!(worker.run_once(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn long_job_without_checkpoints_keeps_its_delivery() {
        let h = harness_with(LifecycleConfig::default(), Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));
        // Never calls `check`; only the heartbeat keeps the message invisible.
        let pool = WorkerPool::spawn(
            worker_config()
                .with_concurrency(2)
                .with_max_deliveries(2)
                .with_heartbeat_interval(Duration::from_millis(20)),
            h.store.clone(),
            h.queue.clone(),
            counting_registry(runs.clone(), Duration::from_millis(400)),
        )
        .unwrap();

        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();
        let record = h.wait_for_terminal(job_id.as_str(), Duration::from_secs(5));
        assert_eq!(pool.shutdown(), 0);

        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.output, Some(json!({"scene_graph": "X"})));
        assert_eq!(record.attempt, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.ready_len(), 0);
        assert_eq!(h.queue.in_flight_len(), 0);
    }

    #[test]
    fn expired_record_reads_as_not_found() {
        let h = harness_with(
            LifecycleConfig {
                ttl: Duration::from_millis(30),
                ..LifecycleConfig::default()
            },
            Duration::from_secs(60),
        );
        let job_id = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();
        assert!(h.manager.get_status(job_id.as_str()).is_ok());

        thread::sleep(Duration::from_millis(60));
        assert!(matches!(h.manager.get_status(job_id.as_str()), Err(JobError::NotFound(_))));
        assert!(matches!(h.manager.cancel(job_id.as_str()), Err(JobError::NotFound(_))));
    }

    #[test]
    fn worker_pool_processes_mixed_jobs() {
        let h = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::spawn(
            worker_config().with_concurrency(2),
            h.store.clone(),
            h.queue.clone(),
            counting_registry(runs.clone(), Duration::from_millis(5)),
        )
        .unwrap();

        let ok = h.manager.submit(JobKind::MetaToSceneGraph, json!({"meta": "X"})).unwrap();
        let found = h
            .manager
            .submit(JobKind::RetrieveSceneGraph, json!({"query": "a red car"}))
            .unwrap();
        let missing = h
            .manager
            .submit(JobKind::RetrieveSceneGraph, json!({"query": "nothing"}))
            .unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(h.wait_for_terminal(ok.as_str(), timeout).state, JobState::Succeeded);

        let found = h.wait_for_terminal(found.as_str(), timeout);
        assert_eq!(found.state, JobState::Succeeded);
        assert_eq!(found.output, Some(json!({"matches": ["a red car"]})));

        let missing = h.wait_for_terminal(missing.as_str(), timeout);
        assert_eq!(missing.state, JobState::Failed);
        assert_eq!(missing.error.unwrap().kind, ErrorKind::ProcessingFailed);

        // Stats are recorded just after the final write.
        let deadline = Instant::now() + timeout;
        while pool.stats().jobs_processed < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = pool.stats();
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(stats.jobs_failed, 1);
        pool.shutdown();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
