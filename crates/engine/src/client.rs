//! The client facade consumed by the HTTP layer.
//!
//! A [`JobClient`] is cheap to clone and talks to intake and the collector
//! over their channels. Submission is the one operation that also touches
//! disk directly: after intake confirms the id, the client writes the
//! journal record that makes the job durable.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use jobmill_core::job::{
    CallbackMethod, JobStatus, JobStatusSummary, JournalRecord, RequestContext, SubmitEnvelope,
};
use jobmill_core::jobid::{InvalidJobId, validate_jobid};
use jobmill_core::store::{JobStore, StoreError};

use crate::api::{EngineConfig, MetadataReply, ResultReply};
use crate::collector::CollectorMsg;
use crate::intake::{IntakeMsg, SubmitAck};
use crate::registry::{ActionContext, ActionNotFound, ActionRegistry};

/// The engine's channels are closed; it has stopped or never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("engine is not running")]
pub struct EngineDown;

/// Failures surfaced synchronously by [`JobClient::submit`].
///
/// Everything that goes wrong on a worker later surfaces as the job's
/// terminal state instead, never as a submit error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The caller-supplied id fails the id grammar; nothing was stored.
    #[error(transparent)]
    InvalidJobId(#[from] InvalidJobId),
    /// Intake is gone.
    #[error("engine is not running")]
    EngineDown,
    /// The job was accepted but its journal record could not be written.
    #[error("persist journal record for job {jobid}")]
    Journal {
        /// The confirmed job id.
        jobid: String,
        /// The underlying store failure.
        #[source]
        source: StoreError,
    },
}

/// Failures from [`JobClient::wait_for_result`].
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The job ended in `exception`; the rendered trace is attached.
    #[error("job {jobid} ended in exception: {trace}")]
    JobFailed {
        /// The failed job.
        jobid: String,
        /// The rendered error trace.
        trace: String,
    },
    /// The job reached a terminal state with no result to return.
    #[error("job {jobid} is {status}")]
    JobUnavailable {
        /// The job.
        jobid: String,
        /// Its terminal state (`suppressed` or `corrupted`).
        status: JobStatus,
    },
    /// The wall-clock timeout elapsed; the job itself is unaffected.
    #[error("timed out after {timeout:?} waiting for job {jobid}")]
    TimedOut {
        /// The job being waited on.
        jobid: String,
        /// The configured timeout.
        timeout: Duration,
    },
    /// The engine's channels are closed.
    #[error("engine is not running")]
    EngineDown,
}

impl From<EngineDown> for WaitError {
    fn from(_: EngineDown) -> WaitError {
        WaitError::EngineDown
    }
}

/// Inputs to [`JobClient::submit`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Action name to run.
    pub action: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
    /// Completion callback target.
    pub callback_url: Option<String>,
    /// Completion callback method.
    pub callback_method: Option<CallbackMethod>,
    /// Whether the callback payload includes status and result.
    pub callback_detailed: bool,
    /// Requested lane.
    pub lane: String,
    /// Caller-supplied job id; minted when absent.
    pub jobid: Option<String>,
    /// Caller context recorded in the job's metadata.
    pub request: RequestContext,
}

impl SubmitRequest {
    /// A request for `action` on the default lane with no arguments.
    pub fn new(action: impl Into<String>) -> SubmitRequest {
        SubmitRequest {
            action: action.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            callback_url: None,
            callback_method: None,
            callback_detailed: false,
            lane: EngineConfig::FALLBACK_LANE.to_string(),
            jobid: None,
            request: RequestContext::default(),
        }
    }
}

/// Parse a batch job-id argument: either a JSON array of strings or a
/// bracketed comma-separated list (`[a, b, c]`).
pub fn parse_jobid_list(input: &str) -> Vec<String> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(input) {
        return items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect();
    }
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('[').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(']').unwrap_or(trimmed);
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Facade over a running engine.
#[derive(Clone)]
pub struct JobClient {
    intake_tx: mpsc::Sender<IntakeMsg>,
    collector_tx: mpsc::Sender<CollectorMsg>,
    store: JobStore,
}

impl JobClient {
    pub(crate) fn new(
        intake_tx: mpsc::Sender<IntakeMsg>,
        collector_tx: mpsc::Sender<CollectorMsg>,
        store: JobStore,
    ) -> JobClient {
        JobClient {
            intake_tx,
            collector_tx,
            store,
        }
    }

    /// Submit a job and return its confirmed id.
    ///
    /// Waits synchronously for intake's id confirmation, then writes the
    /// journal record that makes the job survive a crash.
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, SubmitError> {
        if let Some(jobid) = &request.jobid {
            validate_jobid(jobid)?;
        }

        let envelope = SubmitEnvelope {
            action: request.action,
            args: request.args,
            kwargs: request.kwargs,
            callback_url: request.callback_url,
            callback_method: request.callback_method,
            callback_detailed: request.callback_detailed,
            request: request.request,
            lane: request.lane,
            restart_jobid: request.jobid,
            restart_jobcounter: None,
            restart_received: None,
        };

        let ack = self
            .send_submit(envelope.clone())
            .await
            .map_err(|_| SubmitError::EngineDown)?;

        let record = JournalRecord {
            request: envelope,
            attempts: 0,
            completed: false,
        };
        let store = self.store.clone();
        let jobid = ack.jobid.clone();
        let written =
            tokio::task::spawn_blocking(move || store.write_journal(&jobid, &record)).await;
        // A fast action can reach `completed` before the journal write above
        // lands; re-check so a finished job is never journaled as pending.
        if matches!(&written, Ok(Ok(()))) && self.status(&ack.jobid).await == Ok(JobStatus::Completed)
        {
            let store = self.store.clone();
            let jobid = ack.jobid.clone();
            let _ = tokio::task::spawn_blocking(move || store.mark_journal_completed(&jobid)).await;
        }
        match written {
            Ok(Ok(())) => Ok(ack.jobid),
            Ok(Err(source)) => Err(SubmitError::Journal {
                jobid: ack.jobid,
                source,
            }),
            Err(join) => Err(SubmitError::Journal {
                jobid: ack.jobid.clone(),
                source: StoreError::Io {
                    path: self.store.journal_path(&ack.jobid),
                    source: std::io::Error::other(join),
                },
            }),
        }
    }

    pub(crate) async fn send_submit(
        &self,
        envelope: SubmitEnvelope,
    ) -> Result<SubmitAck, EngineDown> {
        let (reply, rx) = oneshot::channel();
        self.intake_tx
            .send(IntakeMsg::Submit { envelope, reply })
            .await
            .map_err(|_| EngineDown)?;
        rx.await.map_err(|_| EngineDown)
    }

    pub(crate) async fn set_jobcounter(&self, value: u64) -> Result<u64, EngineDown> {
        let (reply, rx) = oneshot::channel();
        self.intake_tx
            .send(IntakeMsg::SetCounter { value, reply })
            .await
            .map_err(|_| EngineDown)?;
        rx.await.map_err(|_| EngineDown)
    }

    pub(crate) async fn register(
        &self,
        jobid: String,
        status: JobStatus,
    ) -> Result<(), EngineDown> {
        self.query(|reply| CollectorMsg::Register {
            jobid,
            status,
            reply,
        })
        .await
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CollectorMsg,
    ) -> Result<T, EngineDown> {
        let (reply, rx) = oneshot::channel();
        self.collector_tx
            .send(build(reply))
            .await
            .map_err(|_| EngineDown)?;
        rx.await.map_err(|_| EngineDown)
    }

    /// Current status of one job; `unknown` for ids never seen.
    pub async fn status(&self, jobid: &str) -> Result<JobStatus, EngineDown> {
        let jobid = jobid.to_string();
        self.query(|reply| CollectorMsg::JobStatus { jobid, reply })
            .await
    }

    /// Status summary rows for every known job.
    pub async fn status_all(&self) -> Result<BTreeMap<String, JobStatusSummary>, EngineDown> {
        self.query(|reply| CollectorMsg::StatusDict { reply }).await
    }

    /// Sorted ids of every known job.
    pub async fn job_ids(&self) -> Result<Vec<String>, EngineDown> {
        self.query(|reply| CollectorMsg::JobIds { reply }).await
    }

    /// Statuses for a batch id argument (see [`parse_jobid_list`]).
    pub async fn statuses(&self, ids: &str) -> Result<BTreeMap<String, JobStatus>, EngineDown> {
        let mut out = BTreeMap::new();
        for jobid in parse_jobid_list(ids) {
            let status = self.status(&jobid).await?;
            out.insert(jobid, status);
        }
        Ok(out)
    }

    /// Full metadata record for one job.
    pub async fn metadata(&self, jobid: &str) -> Result<MetadataReply, EngineDown> {
        let jobid = jobid.to_string();
        self.query(|reply| CollectorMsg::JobInput { jobid, reply })
            .await
    }

    /// Result payload for one job; `result` is `None` while non-terminal.
    pub async fn result(&self, jobid: &str) -> Result<ResultReply, EngineDown> {
        let jobid = jobid.to_string();
        self.query(|reply| CollectorMsg::JobResult { jobid, reply })
            .await
    }

    /// Decoded result value, or `Null` when none is available.
    pub async fn unpacked_result(&self, jobid: &str) -> Result<Value, EngineDown> {
        Ok(self.result(jobid).await?.result.unwrap_or(Value::Null))
    }

    /// Poll until the job completes, with a local wall-clock timeout.
    ///
    /// The timeout raises here only; the server-side job keeps running.
    pub async fn wait_for_result(
        &self,
        jobid: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Value, WaitError> {
        let started = Instant::now();
        loop {
            match self.status(jobid).await? {
                JobStatus::Completed => {
                    let reply = self.result(jobid).await?;
                    return Ok(reply.result.unwrap_or(Value::Null));
                }
                JobStatus::Exception => {
                    let reply = self.result(jobid).await?;
                    let trace = match reply.result {
                        Some(Value::String(trace)) => trace,
                        Some(other) => other.to_string(),
                        None => "result unavailable".to_string(),
                    };
                    return Err(WaitError::JobFailed {
                        jobid: jobid.to_string(),
                        trace,
                    });
                }
                status @ (JobStatus::Suppressed | JobStatus::Corrupted) => {
                    return Err(WaitError::JobUnavailable {
                        jobid: jobid.to_string(),
                        status,
                    });
                }
                _ => {}
            }
            if started.elapsed() >= timeout {
                return Err(WaitError::TimedOut {
                    jobid: jobid.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Reload the original submission envelope from a job's journal record.
    pub fn fetch_job(&self, jobid: &str) -> Result<Option<SubmitEnvelope>, StoreError> {
        Ok(self
            .store
            .read_journal(jobid)?
            .map(|record| record.request))
    }

    /// Re-run a journaled job's action synchronously against `registry`.
    ///
    /// This is a maintenance hook: it bypasses the queue entirely and does
    /// not touch the job's stored status or result.
    pub async fn retry_job(
        &self,
        registry: &ActionRegistry,
        jobid: &str,
    ) -> anyhow::Result<Value> {
        let Some(envelope) = self.fetch_job(jobid)? else {
            anyhow::bail!("no journal record for job {jobid}");
        };
        let Some(handler) = registry.resolve(&envelope.action) else {
            return Err(ActionNotFound(envelope.action).into());
        };
        let ctx = ActionContext {
            jobid: jobid.to_string(),
        };
        handler(ctx, envelope.args, envelope.kwargs).await
    }
}
