//! Public configuration and lifecycle types for the engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobmill_core::clock::DEFAULT_TIMEZONE;
use jobmill_core::job::{JobMetadata, JobStatus};
use jobmill_core::lock::DEFAULT_LOCK_DEADLINE;

use crate::callback::SideChannelConfig;
use crate::registry::RegistryFactory;

/// A named worker pool with its own FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneSpec {
    /// Lane name as requested at submission.
    pub name: String,
    /// Number of workers serving this lane.
    pub workers: usize,
}

impl LaneSpec {
    /// A lane with an explicit worker count.
    pub fn new(name: impl Into<String>, workers: usize) -> LaneSpec {
        LaneSpec {
            name: name.into(),
            workers,
        }
    }
}

/// Retry behavior for one action invocation on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Invocations before the job goes to `exception` (clamped to
    /// [`RetryPolicy::MAX_EXEC_ATTEMPTS`]).
    pub attempts: u32,
    /// Lower bound of the random backoff between invocations.
    pub delay_min: Duration,
    /// Upper bound of the random backoff between invocations.
    pub delay_max: Duration,
}

impl RetryPolicy {
    /// Hard ceiling on invocations per job, whatever `attempts` says.
    pub const MAX_EXEC_ATTEMPTS: u32 = 10;
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay_min: Duration::from_secs(1),
            delay_max: Duration::from_secs(60),
        }
    }
}

/// Bounds for the collector's per-job status summary cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCacheConfig {
    /// Maximum cached jobs; the oldest entry is evicted past this.
    pub capacity: usize,
    /// How long a cached summary may be served.
    pub ttl: Duration,
}

impl Default for StatusCacheConfig {
    fn default() -> StatusCacheConfig {
        StatusCacheConfig {
            capacity: 1024,
            ttl: Duration::from_secs(10),
        }
    }
}

/// Configuration for [`start_engine`].
#[derive(Clone)]
pub struct EngineConfig {
    /// Directory holding every durable per-job artifact.
    pub store_dir: PathBuf,
    /// Worker lanes; must include `slow`, the fallback for unknown lanes.
    pub lanes: Vec<LaneSpec>,
    /// Opens each worker's action registry.
    pub registry: Arc<dyn RegistryFactory>,
    /// Replays of an interrupted job before it is suppressed at recovery.
    pub max_attempts: u32,
    /// Age in days past which completed jobs are archived at recovery.
    pub archive_days: u32,
    /// Per-invocation retry behavior on workers.
    pub retry: RetryPolicy,
    /// How long store operations wait on a held advisory lock.
    pub lock_deadline: Duration,
    /// Zone every timestamp is rendered in.
    pub timezone: Tz,
    /// Optional non-HTTP delivery hook for completion callbacks.
    pub side_channel: Option<SideChannelConfig>,
    /// Bounds for the status summary cache.
    pub status_cache: StatusCacheConfig,
}

impl EngineConfig {
    /// Default worker count per lane.
    pub const DEFAULT_LANE_WORKERS: usize = 2;
    /// Default replay budget before suppression.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
    /// Default archive horizon in days.
    pub const DEFAULT_ARCHIVE_DAYS: u32 = 3;
    /// Name of the lane unknown lane requests are rewritten to.
    pub const FALLBACK_LANE: &'static str = "slow";

    /// A configuration with the default lanes and tunables.
    pub fn new(store_dir: impl Into<PathBuf>, registry: Arc<dyn RegistryFactory>) -> EngineConfig {
        EngineConfig {
            store_dir: store_dir.into(),
            lanes: vec![
                LaneSpec::new(Self::FALLBACK_LANE, Self::DEFAULT_LANE_WORKERS),
                LaneSpec::new("fast", Self::DEFAULT_LANE_WORKERS),
            ],
            registry,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            archive_days: Self::DEFAULT_ARCHIVE_DAYS,
            retry: RetryPolicy::default(),
            lock_deadline: DEFAULT_LOCK_DEADLINE,
            timezone: DEFAULT_TIMEZONE,
            side_channel: None,
            status_cache: StatusCacheConfig::default(),
        }
    }
}

/// Reply to a metadata query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataReply {
    /// Current lifecycle state of the job.
    pub status: JobStatus,
    /// The stored metadata record, when readable.
    pub metadata: Option<JobMetadata>,
}

/// Reply to a result query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReply {
    /// For terminal jobs, how execution ended; otherwise the current state.
    pub status: JobStatus,
    /// The decoded result payload; `None` while the job is non-terminal.
    pub result: Option<Value>,
}

/// Handle on a running engine.
///
/// Dropping the handle does not stop the engine; call
/// [`EngineHandle::shutdown`] (or [`EngineHandle::request_stop`] followed by
/// [`EngineHandle::wait`]) for a graceful stop that lets in-flight jobs
/// publish their results first.
pub struct EngineHandle {
    pub(crate) client: crate::client::JobClient,
    pub(crate) stop_tx: tokio::sync::watch::Sender<bool>,
    pub(crate) tasks: tokio::task::JoinSet<()>,
    pub(crate) collector: tokio::task::JoinHandle<()>,
    pub(crate) callbacks: tokio::task::JoinHandle<()>,
}

impl EngineHandle {
    /// A client facade bound to this engine.
    pub fn client(&self) -> crate::client::JobClient {
        self.client.clone()
    }

    /// Ask the engine to stop accepting submissions and wind down.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for every pipeline task to finish.
    ///
    /// The collector keeps serving reads until the last
    /// [`JobClient`](crate::client::JobClient) clone is dropped, so callers
    /// holding clones must drop them first.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        while let Some(res) = self.tasks.join_next().await {
            res?;
        }
        drop(self.client);
        self.collector.await?;
        self.callbacks.await?;
        Ok(())
    }

    /// Request a stop and wait for the pipeline to drain.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_stop();
        self.wait().await
    }
}

/// Start an engine: spawn the pipeline, sweep leftover locks, and replay
/// interrupted jobs from the store directory.
pub async fn start_engine(config: EngineConfig) -> anyhow::Result<EngineHandle> {
    crate::engine::start_engine(config).await
}
