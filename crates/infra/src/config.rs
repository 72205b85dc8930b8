//! Configuration loading and representation.
//!
//! Everything comes from the process environment (a `.env` file is loaded by
//! the binary before this runs). [`PipelineConfig::from_lookup`] takes any
//! key lookup so tests do not have to touch the real environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::queue::RedisQueueConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Which storage backends the process runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// In-memory job store, queue and marketplace. Nothing survives a restart.
    InMemory,
    /// Postgres job store and marketplace, Redis Streams queue.
    Persistent { database_url: String, queue: RedisQueueConfig },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub pool_name: String,
    pub concurrency: usize,
    /// Sleep after a failed dequeue before trying again.
    pub poll_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_name: "generation".to_string(),
            concurrency: 4,
            poll_backoff: Duration::from_secs(1),
        }
    }
}

/// Time a worker needs after the inference call returns: re-reading the job,
/// writing the owning record and recording COMPLETED.
pub const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// A queue lease must outlive one whole handler run, or a second consumer
/// reclaims the task while the first is still working on it.
pub fn check_lease(visibility_timeout: Duration, generation_timeout: Duration) -> Result<(), ConfigError> {
    let needed = generation_timeout + LEASE_MARGIN;
    if visibility_timeout <= needed {
        return Err(ConfigError::Invalid {
            key: "QUEUE_VISIBILITY_TIMEOUT_MS",
            message: format!(
                "{}ms must exceed the generation timeout plus {}s ({}ms)",
                visibility_timeout.as_millis(),
                LEASE_MARGIN.as_secs(),
                needed.as_millis()
            ),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub bind_addr: SocketAddr,
    pub storage: StorageConfig,
    pub generation_url: Url,
    pub generation_timeout: Duration,
    /// Lease length for delivered tasks, in both queue backends.
    pub queue_visibility_timeout: Duration,
    pub workers: WorkerConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr: SocketAddr = parse_or(&get, "BIND_ADDR", "0.0.0.0:8080".parse().ok())?;

        let generation_url = get("GENERATION_SERVICE_URL").ok_or(ConfigError::Missing("GENERATION_SERVICE_URL"))?;
        let generation_url = Url::parse(&generation_url).map_err(|e| ConfigError::Invalid {
            key: "GENERATION_SERVICE_URL",
            message: e.to_string(),
        })?;
        let timeout_secs: u64 = parse_or(&get, "GENERATION_TIMEOUT_SECS", Some(120))?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "GENERATION_TIMEOUT_SECS",
                message: "must be greater than zero".into(),
            });
        }
        let generation_timeout = Duration::from_secs(timeout_secs);

        let visibility_ms: u64 = parse_or(&get, "QUEUE_VISIBILITY_TIMEOUT_MS", Some(300_000))?;
        let queue_visibility_timeout = Duration::from_millis(visibility_ms);
        check_lease(queue_visibility_timeout, generation_timeout)?;

        let persistent: bool = parse_or(&get, "USE_PERSISTENT_STORES", Some(false))?;
        let storage = if persistent {
            let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
            let mut queue = RedisQueueConfig::new(
                get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            );
            if let Some(key) = get("QUEUE_STREAM_KEY") {
                queue.stream_key = key;
            }
            if let Some(group) = get("QUEUE_GROUP") {
                queue.group = group;
            }
            queue.visibility_timeout = queue_visibility_timeout;
            StorageConfig::Persistent { database_url, queue }
        } else {
            StorageConfig::InMemory
        };

        let mut workers = WorkerConfig::default();
        workers.concurrency = parse_or(&get, "WORKER_CONCURRENCY", Some(workers.concurrency))?;
        if workers.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                message: "must be at least 1".into(),
            });
        }
        if let Some(name) = get("WORKER_POOL_NAME") {
            workers.pool_name = name;
        }

        Ok(Self {
            bind_addr,
            storage,
            generation_url,
            generation_timeout,
            queue_visibility_timeout,
            workers,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        None => default.ok_or(ConfigError::Missing(key)),
    }
}
