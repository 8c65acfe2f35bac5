//! The collector: sole owner of the status table and sole writer of the
//! durable stores.
//!
//! Runs on its own blocking thread and serves one message at a time, so the
//! in-memory table needs no locking. Shelf access below it goes through the
//! per-file advisory locks in `jobmill-core`.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono_tz::Tz;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use jobmill_core::clock::{timedelta, timestamp_now};
use jobmill_core::job::{
    CallbackMethod, EngineResult, JobMetadata, JobStatus, JobStatusSummary,
};
use jobmill_core::jobid::validate_jobid;
use jobmill_core::store::{JobStore, StoreError};

use crate::api::{MetadataReply, ResultReply, StatusCacheConfig};
use crate::callback::CallbackJob;

pub(crate) enum CollectorMsg {
    Notification {
        jobid: String,
        status: JobStatus,
    },
    Metadata {
        jobid: String,
        metadata: Box<JobMetadata>,
    },
    Store {
        jobid: String,
        result: EngineResult,
        callback_url: Option<String>,
        callback_method: Option<CallbackMethod>,
        callback_detailed: bool,
    },
    Register {
        jobid: String,
        status: JobStatus,
        reply: oneshot::Sender<()>,
    },
    JobStatus {
        jobid: String,
        reply: oneshot::Sender<JobStatus>,
    },
    StatusDict {
        reply: oneshot::Sender<BTreeMap<String, JobStatusSummary>>,
    },
    JobIds {
        reply: oneshot::Sender<Vec<String>>,
    },
    JobInput {
        jobid: String,
        reply: oneshot::Sender<MetadataReply>,
    },
    JobResult {
        jobid: String,
        reply: oneshot::Sender<ResultReply>,
    },
}

pub(crate) fn run_collector(
    mut rx: mpsc::Receiver<CollectorMsg>,
    store: JobStore,
    tz: Tz,
    cache: StatusCacheConfig,
    callback_tx: mpsc::UnboundedSender<CallbackJob>,
) {
    let mut collector = Collector {
        store,
        tz,
        table: BTreeMap::new(),
        cache: StatusCache::new(cache),
        callback_tx,
    };
    while let Some(msg) = rx.blocking_recv() {
        collector.handle(msg);
    }
    debug!("collector stopped");
}

struct Collector {
    store: JobStore,
    tz: Tz,
    table: BTreeMap<String, JobStatus>,
    cache: StatusCache,
    callback_tx: mpsc::UnboundedSender<CallbackJob>,
}

impl Collector {
    fn handle(&mut self, msg: CollectorMsg) {
        match msg {
            CollectorMsg::Notification { jobid, status } => self.on_notification(jobid, status),
            CollectorMsg::Metadata { jobid, metadata } => self.on_metadata(jobid, *metadata),
            CollectorMsg::Store {
                jobid,
                result,
                callback_url,
                callback_method,
                callback_detailed,
            } => self.on_store(jobid, result, callback_url, callback_method, callback_detailed),
            CollectorMsg::Register {
                jobid,
                status,
                reply,
            } => {
                self.on_register(jobid, status);
                let _ = reply.send(());
            }
            CollectorMsg::JobStatus { jobid, reply } => {
                let _ = reply.send(self.job_status(&jobid));
            }
            CollectorMsg::StatusDict { reply } => {
                let _ = reply.send(self.status_dict());
            }
            CollectorMsg::JobIds { reply } => {
                let _ = reply.send(self.table.keys().cloned().collect());
            }
            CollectorMsg::JobInput { jobid, reply } => {
                let _ = reply.send(self.job_input(&jobid));
            }
            CollectorMsg::JobResult { jobid, reply } => {
                let _ = reply.send(self.job_result(&jobid));
            }
        }
    }

    fn on_notification(&mut self, jobid: String, status: JobStatus) {
        if let Err(err) = validate_jobid(&jobid) {
            warn!(%err, "dropping notification");
            return;
        }

        // A terminal status only moves backwards for an explicit
        // resubmission, which always starts over at `received`.
        let current = self.table.get(&jobid).copied();
        if current.is_some_and(|s| s.is_terminal())
            && !status.is_terminal()
            && status != JobStatus::Received
        {
            warn!(jobid, current = ?current, %status, "ignoring stale transition");
            return;
        }

        let prev = self.table.insert(jobid.clone(), status);
        debug!(jobid, prev = ?prev, %status, "status transition");
        self.cache.invalidate(&jobid);

        if status == JobStatus::Received && prev.is_none() {
            if let Err(err) = self.store.create_runtime_lock(&jobid) {
                warn!(jobid, "could not create runtime lock: {err:#}");
            }
        }
        if status == JobStatus::Completed {
            if let Err(err) = self.store.remove_runtime_lock(&jobid) {
                warn!(jobid, "could not remove runtime lock: {err:#}");
            }
            if let Err(err) = self.store.mark_journal_completed(&jobid) {
                warn!(jobid, "could not mark journal completed: {err:#}");
            }
        }

        self.touch_times(&jobid, status);
    }

    fn touch_times(&self, jobid: &str, status: JobStatus) {
        let mut metadata = match self.store.read_metadata(jobid) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return,
            Err(err) => {
                warn!(jobid, "skipping time update: {err:#}");
                return;
            }
        };

        let times = &mut metadata.times;
        times.updated = Some(timestamp_now(self.tz));
        if status == JobStatus::Working {
            times.started = Some(timestamp_now(self.tz));
        }
        // The completed stamp is written exactly once.
        if status == JobStatus::Completed && times.completed.is_none() {
            times.completed = Some(timestamp_now(self.tz));
        }

        if let (Some(started), Some(completed)) = (times.started.clone(), times.completed.clone())
        {
            if times.runtime.is_none() {
                match timedelta(&started, &completed) {
                    Ok(delta) => {
                        times.runtime = Some(delta.to_string());
                        times.runtime_sec = Some(delta.total_seconds);
                    }
                    Err(err) => warn!(jobid, %err, "could not compute runtime"),
                }
            }
        }
        if let (Some(received), Some(completed)) = (times.received.clone(), times.completed.clone())
        {
            if times.turnaround.is_none() {
                match timedelta(&received, &completed) {
                    Ok(delta) => {
                        times.turnaround = Some(delta.to_string());
                        times.turnaround_sec = Some(delta.total_seconds);
                    }
                    Err(err) => warn!(jobid, %err, "could not compute turnaround"),
                }
            }
        }

        if let Err(err) = self.store.write_metadata(jobid, &metadata) {
            warn!(jobid, "could not persist times: {err:#}");
        }
    }

    fn on_metadata(&mut self, jobid: String, metadata: JobMetadata) {
        self.cache.invalidate(&jobid);
        if let Err(err) = self.store.write_metadata(&jobid, &metadata) {
            warn!(jobid, "could not persist metadata: {err:#}");
        }
    }

    fn on_store(
        &mut self,
        jobid: String,
        result: EngineResult,
        callback_url: Option<String>,
        callback_method: Option<CallbackMethod>,
        callback_detailed: bool,
    ) {
        let jobid = if result.jobid.is_empty() {
            jobid
        } else {
            result.jobid.clone()
        };
        self.cache.invalidate(&jobid);

        if let Err(err) = self.store.write_result(&jobid, &result) {
            warn!(jobid, "could not persist result: {err:#}");
        }
        debug!(jobid, status = ?result.exec_status, "stored result");

        if let Some(url) = callback_url {
            let job = CallbackJob {
                jobid: jobid.clone(),
                url,
                method: callback_method.unwrap_or(CallbackMethod::Post),
                detailed: callback_detailed,
                result,
            };
            if self.callback_tx.send(job).is_err() {
                warn!(jobid, "callback dispatcher gone, callback dropped");
            }
        }
    }

    fn on_register(&mut self, jobid: String, mut status: JobStatus) {
        if status == JobStatus::Completed {
            let metadata_ok = matches!(self.store.read_metadata(&jobid), Ok(Some(_)));
            let result_ok = matches!(self.store.read_result(&jobid), Ok(Some(_)));
            if !metadata_ok || !result_ok {
                warn!(jobid, "completed job has unreadable records, downgrading to corrupted");
                status = JobStatus::Corrupted;
            }
        }
        debug!(jobid, %status, "registered job");
        self.cache.invalidate(&jobid);
        self.table.insert(jobid, status);
    }

    fn job_status(&self, jobid: &str) -> JobStatus {
        self.table.get(jobid).copied().unwrap_or(JobStatus::Unknown)
    }

    fn status_dict(&mut self) -> BTreeMap<String, JobStatusSummary> {
        let jobs: Vec<(String, JobStatus)> = self
            .table
            .iter()
            .map(|(jobid, status)| (jobid.clone(), *status))
            .collect();

        let mut out = BTreeMap::new();
        for (jobid, status) in jobs {
            if let Some(summary) = self.cache.get(&jobid) {
                out.insert(jobid, summary);
                continue;
            }
            let (summary, cacheable) = self.build_summary(&jobid, status);
            if cacheable {
                self.cache.insert(jobid.clone(), summary.clone());
            }
            out.insert(jobid, summary);
        }
        out
    }

    fn build_summary(&self, jobid: &str, status: JobStatus) -> (JobStatusSummary, bool) {
        match self.store.read_metadata(jobid) {
            Ok(Some(metadata)) => (JobStatusSummary::from_metadata(status, &metadata), true),
            Ok(None) | Err(_) => {
                let status = match status {
                    JobStatus::Corrupted | JobStatus::Suppressed => status,
                    JobStatus::Completed => JobStatus::Corrupted,
                    other => other,
                };
                let cacheable = matches!(status, JobStatus::Corrupted | JobStatus::Suppressed);
                (JobStatusSummary::bare(status), cacheable)
            }
        }
    }

    fn job_input(&self, jobid: &str) -> MetadataReply {
        let status = self.job_status(jobid);
        if status == JobStatus::Unknown {
            return MetadataReply {
                status,
                metadata: None,
            };
        }
        match self.store.read_metadata(jobid) {
            Ok(Some(metadata)) => MetadataReply {
                status,
                metadata: Some(metadata),
            },
            Err(StoreError::LockTimeout { .. }) => {
                warn!(jobid, "metadata read timed out on lock");
                MetadataReply {
                    status,
                    metadata: None,
                }
            }
            Ok(None) => MetadataReply {
                status: JobStatus::Corrupted,
                metadata: None,
            },
            Err(err) => {
                warn!(jobid, "unreadable metadata shelf: {err:#}");
                MetadataReply {
                    status: JobStatus::Corrupted,
                    metadata: None,
                }
            }
        }
    }

    fn job_result(&mut self, jobid: &str) -> ResultReply {
        let status = self.job_status(jobid);
        if status == JobStatus::Unknown {
            return ResultReply {
                status,
                result: None,
            };
        }
        match self.store.read_result(jobid) {
            Ok(Some(result)) => {
                let value = serde_json::from_str(&result.json_result)
                    .unwrap_or(Value::String(result.json_result));
                ResultReply {
                    status: result.exec_status.into(),
                    result: Some(value),
                }
            }
            Err(StoreError::LockTimeout { .. }) => {
                warn!(jobid, "result read timed out on lock");
                ResultReply {
                    status,
                    result: None,
                }
            }
            Ok(None) => {
                if status == JobStatus::Completed {
                    self.downgrade_corrupted(jobid);
                    ResultReply {
                        status: JobStatus::Corrupted,
                        result: None,
                    }
                } else {
                    ResultReply {
                        status,
                        result: None,
                    }
                }
            }
            Err(err) => {
                warn!(jobid, "unreadable result shelf: {err:#}");
                if status == JobStatus::Completed {
                    self.downgrade_corrupted(jobid);
                    ResultReply {
                        status: JobStatus::Corrupted,
                        result: None,
                    }
                } else {
                    ResultReply {
                        status,
                        result: None,
                    }
                }
            }
        }
    }

    fn downgrade_corrupted(&mut self, jobid: &str) {
        warn!(jobid, "completed job lost its result, downgrading to corrupted");
        self.table.insert(jobid.to_string(), JobStatus::Corrupted);
        self.cache.invalidate(jobid);
    }
}

/// Bounded, time-based cache of status summary rows.
struct StatusCache {
    config: StatusCacheConfig,
    entries: HashMap<String, (Instant, JobStatusSummary)>,
}

impl StatusCache {
    fn new(config: StatusCacheConfig) -> StatusCache {
        StatusCache {
            config,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, jobid: &str) -> Option<JobStatusSummary> {
        match self.entries.get(jobid) {
            Some((at, summary)) if at.elapsed() <= self.config.ttl => Some(summary.clone()),
            Some(_) => {
                self.entries.remove(jobid);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, jobid: String, summary: JobStatusSummary) {
        if self.config.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&jobid) && self.entries.len() >= self.config.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(jobid, _)| jobid.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(jobid, (Instant::now(), summary));
    }

    fn invalidate(&mut self, jobid: &str) {
        self.entries.remove(jobid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn summary(status: JobStatus) -> JobStatusSummary {
        JobStatusSummary::bare(status)
    }

    #[test]
    fn cache_serves_fresh_entries_and_expires_old_ones() {
        let mut cache = StatusCache::new(StatusCacheConfig {
            capacity: 4,
            ttl: Duration::from_millis(20),
        });
        cache.insert("a".to_string(), summary(JobStatus::Completed));
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache = StatusCache::new(StatusCacheConfig {
            capacity: 2,
            ttl: Duration::from_secs(60),
        });
        cache.insert("a".to_string(), summary(JobStatus::Completed));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".to_string(), summary(JobStatus::Completed));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c".to_string(), summary(JobStatus::Completed));
        assert_eq!(cache.entries.len(), 2);
        // The oldest entry was evicted.
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn invalidation_removes_entries() {
        let mut cache = StatusCache::new(StatusCacheConfig::default());
        cache.insert("a".to_string(), summary(JobStatus::Working));
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
    }
}
