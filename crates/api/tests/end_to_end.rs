#![cfg(unix)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use mediagraph_api::{JobApi, StatusView, SubmitRequest};
use mediagraph_core::{ErrorKind, JobKind, JobState};
use mediagraph_infra::{InMemoryResultStore, InMemoryWorkQueue, LifecycleManager, Settings, WorkerPool};
use mediagraph_processing::{CommandProcessor, ProcessorRegistry};

type Api = JobApi<Arc<InMemoryResultStore>, Arc<InMemoryWorkQueue>>;

fn settings() -> Settings {
    let vars: HashMap<&str, &str> = [
        ("MEDIAGRAPH_META2GRAPH_CMD", "cat"),
        ("MEDIAGRAPH_RETRIEVE_CMD", "false"),
        ("MEDIAGRAPH_POLL_INTERVAL_MS", "10"),
        ("MEDIAGRAPH_CHECKPOINT_INTERVAL_MS", "20"),
    ]
    .into_iter()
    .collect();
    Settings::from_lookup(|var| vars.get(var).map(|v| v.to_string())).unwrap()
}

fn registry(settings: &Settings) -> Arc<ProcessorRegistry> {
    let meta = CommandProcessor::from_command_line(
        JobKind::MetaToSceneGraph,
        settings.meta_to_scene_graph_cmd.as_deref().unwrap(),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(10));
    let retrieve = CommandProcessor::from_command_line(
        JobKind::RetrieveSceneGraph,
        settings.retrieve_scene_graph_cmd.as_deref().unwrap(),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(10));

    Arc::new(ProcessorRegistry::builder().register(meta).register(retrieve).build().unwrap())
}

fn wait_until_terminal(api: &Api, job_id: &str) -> StatusView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = api.status(job_id).unwrap();
        if matches!(view.state, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
            || Instant::now() >= deadline
        {
            return view;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn jobs_flow_from_submit_to_result() {
    let settings = settings();
    let store = InMemoryResultStore::arc();
    let queue = Arc::new(InMemoryWorkQueue::new(settings.visibility_timeout));
    let api: Api = JobApi::new(LifecycleManager::with_config(
        store.clone(),
        queue.clone(),
        settings.lifecycle(),
    ));

    // Cancelled before any worker is running.
    let early = api
        .submit(SubmitRequest {
            kind: "META_TO_SCENEGRAPH".into(),
            input: json!({"meta": "early"}),
        })
        .unwrap();
    let cancelled = api.cancel(early.job_id.as_str()).unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    let pool = WorkerPool::spawn(settings.worker(), store, queue, registry(&settings)).unwrap();

    let meta = api
        .submit(SubmitRequest {
            kind: "META_TO_SCENEGRAPH".into(),
            input: json!({"meta": "X"}),
        })
        .unwrap();
    let retrieve = api
        .submit(SubmitRequest {
            kind: "RETRIEVE_SCENEGRAPH".into(),
            input: json!({"query": "a red car"}),
        })
        .unwrap();

    let done = wait_until_terminal(&api, meta.job_id.as_str());
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.status, 202);
    assert_eq!(done.output, Some(json!({"meta": "X"})));
    assert_eq!(done.progress, 100.0);

    let failed = wait_until_terminal(&api, retrieve.job_id.as_str());
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.output.is_none());
    assert_eq!(failed.error.unwrap().kind, ErrorKind::ProcessingFailed);

    pool.shutdown();

    let early = api.status(early.job_id.as_str()).unwrap();
    assert_eq!(early.state, JobState::Cancelled);
    assert!(early.output.is_none());
    assert!(early.error.is_none());
}
