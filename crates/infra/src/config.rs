//! Process configuration from `MEDIAGRAPH_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use mediagraph_core::input::DEFAULT_MAX_INPUT_BYTES;

use crate::lifecycle::LifecycleConfig;
use crate::workers::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub redis_url: String,
    pub job_ttl: Duration,
    pub visibility_timeout: Duration,
    pub workers: usize,
    pub max_deliveries: u32,
    /// `None` disables the limit (`MEDIAGRAPH_SOFT_TIME_LIMIT_SECS=0`).
    pub soft_time_limit: Option<Duration>,
    pub checkpoint_interval: Duration,
    pub poll_interval: Duration,
    pub max_input_bytes: usize,
    /// Command line of the META_TO_SCENEGRAPH processor executable.
    pub meta_to_scene_graph_cmd: Option<String>,
    /// Command line of the RETRIEVE_SCENEGRAPH processor executable.
    pub retrieve_scene_graph_cmd: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            job_ttl: Duration::from_secs(3600),
            visibility_timeout: Duration::from_secs(60),
            workers: 2,
            max_deliveries: 5,
            soft_time_limit: Some(Duration::from_secs(1500)),
            checkpoint_interval: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(500),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            meta_to_scene_graph_cmd: None,
            retrieve_scene_graph_cmd: None,
        }
    }
}

fn parse<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T>(var: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read settings through `lookup`; unset or empty variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();

        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(var, lookup(var), default.as_secs()).map(Duration::from_secs)
        };
        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(var, lookup(var), default.as_millis() as u64).map(Duration::from_millis)
        };
        let command = |var: &'static str| lookup(var).filter(|s| !s.trim().is_empty());

        let soft_limit_secs = parse(
            "MEDIAGRAPH_SOFT_TIME_LIMIT_SECS",
            lookup("MEDIAGRAPH_SOFT_TIME_LIMIT_SECS"),
            d.soft_time_limit.map_or(0, |l| l.as_secs()),
        )?;

        let settings = Self {
            redis_url: lookup("REDIS_URL")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(d.redis_url),
            job_ttl: positive("MEDIAGRAPH_JOB_TTL_SECS", secs("MEDIAGRAPH_JOB_TTL_SECS", d.job_ttl)?.as_secs())
                .map(Duration::from_secs)?,
            visibility_timeout: positive(
                "MEDIAGRAPH_VISIBILITY_TIMEOUT_SECS",
                secs("MEDIAGRAPH_VISIBILITY_TIMEOUT_SECS", d.visibility_timeout)?.as_secs(),
            )
            .map(Duration::from_secs)?,
            workers: positive("MEDIAGRAPH_WORKERS", parse("MEDIAGRAPH_WORKERS", lookup("MEDIAGRAPH_WORKERS"), d.workers)?)?,
            max_deliveries: positive(
                "MEDIAGRAPH_MAX_DELIVERIES",
                parse("MEDIAGRAPH_MAX_DELIVERIES", lookup("MEDIAGRAPH_MAX_DELIVERIES"), d.max_deliveries)?,
            )?,
            soft_time_limit: (soft_limit_secs > 0).then(|| Duration::from_secs(soft_limit_secs)),
            checkpoint_interval: millis("MEDIAGRAPH_CHECKPOINT_INTERVAL_MS", d.checkpoint_interval)?,
            poll_interval: millis("MEDIAGRAPH_POLL_INTERVAL_MS", d.poll_interval)?,
            max_input_bytes: positive(
                "MEDIAGRAPH_MAX_INPUT_BYTES",
                parse("MEDIAGRAPH_MAX_INPUT_BYTES", lookup("MEDIAGRAPH_MAX_INPUT_BYTES"), d.max_input_bytes)?,
            )?,
            meta_to_scene_graph_cmd: command("MEDIAGRAPH_META2GRAPH_CMD"),
            retrieve_scene_graph_cmd: command("MEDIAGRAPH_RETRIEVE_CMD"),
        };

        // Checkpoints also extend the delivery, so they must come around before it lapses.
        if settings.checkpoint_interval >= settings.visibility_timeout {
            return Err(ConfigError::Invalid {
                var: "MEDIAGRAPH_CHECKPOINT_INTERVAL_MS",
                value: settings.checkpoint_interval.as_millis().to_string(),
                reason: format!(
                    "must be shorter than the visibility timeout ({} ms)",
                    settings.visibility_timeout.as_millis()
                ),
            });
        }
        Ok(settings)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            ttl: self.job_ttl,
            max_input_bytes: self.max_input_bytes,
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.workers)
            .with_poll_interval(self.poll_interval)
            .with_max_deliveries(self.max_deliveries)
            .with_soft_time_limit(self.soft_time_limit)
            .with_checkpoint_interval(self.checkpoint_interval)
            .with_heartbeat_interval(self.visibility_timeout / 3)
    }
}
