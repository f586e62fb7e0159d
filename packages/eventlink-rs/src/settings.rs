use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::EventLinkError;
use crate::linker::{EventLinker, DEFAULT_NAMESPACE};
use crate::processing::{
    QueueProcessingService, TaskQueue, TokioProcessingService, WorkerPoolProcessingService,
};

/// Default queue name for [`QueueProcessingService`].
pub const DEFAULT_QUEUE_NAME: &str = "eventlink";

/// Bus configuration loaded from environment variables
///
/// | Variable                              | Default                 |
/// |---------------------------------------|-------------------------|
/// | `EVENTLINK_NAMESPACE`                 | `default`               |
/// | `EVENTLINK_MAX_SUBSCRIBERS`           | unlimited               |
/// | `EVENTLINK_DEBUG`                     | `false`                 |
/// | `EVENTLINK_FORCE_ASYNC`               | `false`                 |
/// | `EVENTLINK_ENFORCE_SUBMISSION_ORDER`  | `false`                 |
/// | `EVENTLINK_POOL_WORKERS`              | available parallelism   |
/// | `EVENTLINK_QUEUE_NAME`                | `eventlink`             |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub namespace: String,
    pub max_subscribers: Option<usize>,
    pub debug: bool,
    pub force_async: bool,
    pub enforce_submission_order: bool,
    pub pool_workers: usize,
    pub queue_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_subscribers: None,
            debug: false,
            force_async: false,
            enforce_submission_order: false,
            pool_workers: default_pool_workers(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

fn default_pool_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

impl Settings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    ///
    /// Unset keys take their default; set keys must parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_subscribers = lookup("EVENTLINK_MAX_SUBSCRIBERS")
            .map(|raw| parse::<usize>("EVENTLINK_MAX_SUBSCRIBERS", &raw))
            .transpose()?;

        Ok(Self {
            namespace: lookup("EVENTLINK_NAMESPACE").unwrap_or(defaults.namespace),
            max_subscribers,
            debug: flag(&lookup, "EVENTLINK_DEBUG")?,
            force_async: flag(&lookup, "EVENTLINK_FORCE_ASYNC")?,
            enforce_submission_order: flag(&lookup, "EVENTLINK_ENFORCE_SUBMISSION_ORDER")?,
            pool_workers: lookup("EVENTLINK_POOL_WORKERS")
                .map(|raw| parse::<usize>("EVENTLINK_POOL_WORKERS", &raw))
                .transpose()?
                .unwrap_or(defaults.pool_workers),
            queue_name: lookup("EVENTLINK_QUEUE_NAME").unwrap_or(defaults.queue_name),
        })
    }

    /// Build the configured namespace.
    pub fn linker(&self) -> Result<EventLinker, EventLinkError> {
        let mut builder = EventLinker::builder()
            .namespace(self.namespace.clone())
            .debug(self.debug);
        if let Some(limit) = self.max_subscribers {
            builder = builder.max_subscribers(limit);
        }
        builder.build()
    }

    /// Build the configured cooperative service.
    pub fn tokio_service(&self) -> TokioProcessingService {
        TokioProcessingService::builder()
            .force_async(self.force_async)
            .enforce_submission_order(self.enforce_submission_order)
            .build()
    }

    /// Start the configured worker pool.
    pub fn worker_pool(&self) -> Result<WorkerPoolProcessingService, EventLinkError> {
        WorkerPoolProcessingService::new(self.pool_workers)
    }

    /// Wrap `queue` in a service using the configured queue name.
    pub fn queue_service<Q: TaskQueue>(&self, queue: Q) -> QueueProcessingService<Q> {
        QueueProcessingService::new(queue, self.queue_name.clone())
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a valid number"))
}

fn flag<F>(lookup: &F, key: &str) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(anyhow!("{key} must be a boolean, got {other:?}")),
        },
    }
}
