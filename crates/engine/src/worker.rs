//! Worker tasks: execute one job at a time with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use jobmill_core::job::{CallbackMethod, EngineResult, ExecStatus, JobStatus};

use crate::api::RetryPolicy;
use crate::collector::CollectorMsg;
use crate::registry::{ActionContext, ActionNotFound, ActionRegistry, RegistryFactory};

/// One job as handed from intake through a lane to a worker.
#[derive(Debug, Clone)]
pub(crate) struct JobAssignment {
    pub(crate) jobid: String,
    pub(crate) action: String,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) callback_url: Option<String>,
    pub(crate) callback_method: Option<CallbackMethod>,
    pub(crate) callback_detailed: bool,
}

pub(crate) enum WorkerCommand {
    Run(JobAssignment),
    Stop,
}

pub(crate) async fn run_worker(
    lane: String,
    worker_idx: usize,
    mut rx: mpsc::Receiver<WorkerCommand>,
    idle_tx: mpsc::UnboundedSender<usize>,
    collector_tx: mpsc::Sender<CollectorMsg>,
    factory: Arc<dyn RegistryFactory>,
    retry: RetryPolicy,
) {
    let opened = tokio::task::spawn_blocking(move || factory.open()).await;
    let registry = match opened {
        Ok(Ok(registry)) => registry,
        Ok(Err(err)) => {
            error!(lane, worker_idx, "failed to open action registry: {err:#}");
            return;
        }
        Err(err) => {
            error!(lane, worker_idx, "registry open task failed: {err:#}");
            return;
        }
    };
    debug!(lane, worker_idx, "worker ready");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Run(job) => {
                run_job(&lane, worker_idx, &registry, &collector_tx, retry, job).await;
                // Only report idle once the result is fully published, so
                // the dispatcher never hands out a second job concurrently.
                let _ = idle_tx.send(worker_idx);
            }
        }
    }
    debug!(lane, worker_idx, "worker stopped");
}

async fn run_job(
    lane: &str,
    worker_idx: usize,
    registry: &ActionRegistry,
    collector_tx: &mpsc::Sender<CollectorMsg>,
    retry: RetryPolicy,
    job: JobAssignment,
) {
    let jobid = job.jobid.clone();
    debug!(lane, worker_idx, jobid, action = %job.action, "starting job");

    notify(collector_tx, &jobid, JobStatus::Working).await;

    let result = execute(registry, retry, &jobid, &job.action, job.args, job.kwargs).await;
    let terminal = JobStatus::from(result.exec_status);

    notify(collector_tx, &jobid, JobStatus::Publishing).await;
    let stored = collector_tx
        .send(CollectorMsg::Store {
            jobid: jobid.clone(),
            result,
            callback_url: job.callback_url,
            callback_method: job.callback_method,
            callback_detailed: job.callback_detailed,
        })
        .await;
    if stored.is_err() {
        warn!(jobid, "collector unavailable, result dropped");
    }
    notify(collector_tx, &jobid, terminal).await;

    debug!(lane, worker_idx, jobid, status = %terminal, "finished job");
}

async fn notify(collector_tx: &mpsc::Sender<CollectorMsg>, jobid: &str, status: JobStatus) {
    let sent = collector_tx
        .send(CollectorMsg::Notification {
            jobid: jobid.to_string(),
            status,
        })
        .await;
    if sent.is_err() {
        warn!(jobid, %status, "collector unavailable, notification dropped");
    }
}

async fn execute(
    registry: &ActionRegistry,
    retry: RetryPolicy,
    jobid: &str,
    action: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
) -> EngineResult {
    let Some(handler) = registry.resolve(action) else {
        let err = ActionNotFound(action.to_string());
        warn!(jobid, "{err}");
        return exception(jobid, err.to_string());
    };

    let attempts = retry.attempts.clamp(1, RetryPolicy::MAX_EXEC_ATTEMPTS);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let ctx = ActionContext {
            jobid: jobid.to_string(),
        };
        match handler(ctx, args.clone(), kwargs.clone()).await {
            Ok(value) => {
                let json_result = match serde_json::to_string(&value) {
                    Ok(json) => json,
                    Err(err) => {
                        return exception(
                            jobid,
                            format!("action {action:?} produced an unencodable result: {err}"),
                        );
                    }
                };
                return EngineResult {
                    exec_status: ExecStatus::Completed,
                    json_result,
                    jobid: jobid.to_string(),
                };
            }
            Err(err) if attempt < attempts => {
                let delay = backoff_delay(&retry);
                warn!(
                    jobid,
                    action,
                    attempt,
                    attempts,
                    "action failed, retrying in {:.2}s: {err:#}",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                let trace = format!("action {action:?} failed for job {jobid}: {err:#}");
                warn!(jobid, action, attempt, "giving up: {err:#}");
                return exception(jobid, trace);
            }
        }
    }
}

fn exception(jobid: &str, trace: String) -> EngineResult {
    EngineResult {
        exec_status: ExecStatus::Exception,
        json_result: Value::String(trace).to_string(),
        jobid: jobid.to_string(),
    }
}

fn backoff_delay(retry: &RetryPolicy) -> Duration {
    let min = retry.delay_min.as_secs_f64();
    let max = retry.delay_max.as_secs_f64();
    if max <= min {
        return retry.delay_min;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
}
