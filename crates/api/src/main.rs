use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use mediagraph_core::JobKind;
use mediagraph_infra::{
    RedisResultStore, RedisStreamsWorkQueue, Resilient, RetryPolicy, Settings, WorkerPool,
};
use mediagraph_processing::{CommandProcessor, ProcessorRegistry};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn build_registry(settings: &Settings) -> anyhow::Result<ProcessorRegistry> {
    let mut builder = ProcessorRegistry::builder();
    for kind in JobKind::ALL {
        let (var, command_line) = match kind {
            JobKind::MetaToSceneGraph => ("MEDIAGRAPH_META2GRAPH_CMD", &settings.meta_to_scene_graph_cmd),
            JobKind::RetrieveSceneGraph => ("MEDIAGRAPH_RETRIEVE_CMD", &settings.retrieve_scene_graph_cmd),
        };
        let command_line = command_line
            .as_deref()
            .with_context(|| format!("{var} must name the {kind} processor executable"))?;
        let processor = CommandProcessor::from_command_line(kind, command_line)
            .with_context(|| format!("{var} is not a valid command line"))?;
        builder = builder.register(processor);
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mediagraph_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let registry = Arc::new(build_registry(&settings)?);

    let store = RedisResultStore::new(&settings.redis_url).context("failed to open result store")?;
    let queue = RedisStreamsWorkQueue::new(&settings.redis_url, None)
        .context("failed to open work queue")?
        .with_visibility_timeout(settings.visibility_timeout);
    queue.ensure_group().context("failed to create consumer group")?;
    tracing::info!(consumer = queue.consumer_name(), redis_url = %settings.redis_url, "connected to redis");

    let store = Arc::new(Resilient::new(store, RetryPolicy::default()));
    let queue = Arc::new(Resilient::new(queue, RetryPolicy::default()));

    let pool = WorkerPool::spawn(settings.worker(), store, queue, registry).context("failed to start workers")?;

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
            _ = ticker.tick() => {
                let stats = serde_json::to_string(&pool.stats()).unwrap_or_default();
                tracing::info!(stats = %stats, "worker pool stats");
            }
        }
    }

    tracing::info!("shutdown requested, waiting for running jobs");
    let panicked = tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .context("worker pool shutdown panicked")?;
    tracing::info!(panicked_workers = panicked, "worker pool stopped");
    Ok(())
}
