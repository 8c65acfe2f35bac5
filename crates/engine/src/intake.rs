//! The intake router: assigns identities and counters, validates lanes, and
//! feeds the collector and lane queues in the canonical order.

use std::collections::HashMap;

use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use jobmill_core::clock::timestamp_now;
use jobmill_core::job::{JobMetadata, JobStatus, JobTimes, SubmitEnvelope};
use jobmill_core::jobid::mint_jobid;

use crate::api::EngineConfig;
use crate::collector::CollectorMsg;
use crate::worker::JobAssignment;

pub(crate) enum IntakeMsg {
    Submit {
        envelope: SubmitEnvelope,
        reply: oneshot::Sender<SubmitAck>,
    },
    SetCounter {
        value: u64,
        reply: oneshot::Sender<u64>,
    },
}

/// Intake's synchronous reply to a submission.
#[derive(Debug, Clone)]
pub(crate) struct SubmitAck {
    pub(crate) jobid: String,
    pub(crate) jobcounter: u64,
}

pub(crate) async fn run_intake(
    mut rx: mpsc::Receiver<IntakeMsg>,
    collector_tx: mpsc::Sender<CollectorMsg>,
    lane_txs: HashMap<String, mpsc::Sender<JobAssignment>>,
    tz: Tz,
    mut stop: watch::Receiver<bool>,
) {
    // The counter lives here and is touched only by this loop; recovery
    // seeds it through SetCounter before replaying journaled jobs.
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                None => break,
                Some(IntakeMsg::SetCounter { value, reply }) => {
                    debug!(value, "job counter updated");
                    counter = value;
                    let _ = reply.send(counter);
                }
                Some(IntakeMsg::Submit { envelope, reply }) => {
                    counter = accept(counter, envelope, reply, &collector_tx, &lane_txs, tz).await;
                }
            }
        }
    }
    debug!("intake stopped");
}

async fn accept(
    counter: u64,
    mut envelope: SubmitEnvelope,
    reply: oneshot::Sender<SubmitAck>,
    collector_tx: &mpsc::Sender<CollectorMsg>,
    lane_txs: &HashMap<String, mpsc::Sender<JobAssignment>>,
    tz: Tz,
) -> u64 {
    let restart = envelope.restart_jobid.is_some();
    let jobid = envelope
        .restart_jobid
        .clone()
        .unwrap_or_else(mint_jobid);
    let jobcounter = envelope.restart_jobcounter.unwrap_or(counter + 1);
    let received = envelope
        .restart_received
        .clone()
        .unwrap_or_else(|| timestamp_now(tz));

    if !lane_txs.contains_key(&envelope.lane) {
        warn!(
            lane = %envelope.lane,
            jobid,
            "unknown lane requested, routing to {}",
            EngineConfig::FALLBACK_LANE
        );
        envelope.lane = EngineConfig::FALLBACK_LANE.to_string();
    }
    debug!(jobid, jobcounter, restart, lane = %envelope.lane, "accepted submission");

    notify(collector_tx, &jobid, JobStatus::Received).await;

    let metadata = JobMetadata {
        jobcounter,
        action: envelope.action.clone(),
        args: envelope.args.clone(),
        kwargs: envelope.kwargs.clone(),
        callback_url: envelope.callback_url.clone(),
        callback_method: envelope.callback_method,
        callback_detailed: envelope.callback_detailed,
        request: envelope.request.clone(),
        lane: envelope.lane.clone(),
        times: JobTimes::received_at(received),
    };
    if collector_tx
        .send(CollectorMsg::Metadata {
            jobid: jobid.clone(),
            metadata: Box::new(metadata),
        })
        .await
        .is_err()
    {
        warn!(jobid, "collector unavailable, metadata dropped");
    }

    notify(collector_tx, &jobid, JobStatus::Accepted).await;

    let _ = reply.send(SubmitAck {
        jobid: jobid.clone(),
        jobcounter,
    });

    // The queued notification goes out before the envelope reaches the
    // lane, so a worker's `working` can never be observed ahead of it.
    notify(collector_tx, &jobid, JobStatus::Queued).await;

    let assignment = JobAssignment {
        jobid: jobid.clone(),
        action: envelope.action,
        args: envelope.args,
        kwargs: envelope.kwargs,
        callback_url: envelope.callback_url,
        callback_method: envelope.callback_method,
        callback_detailed: envelope.callback_detailed,
    };
    match lane_txs.get(&envelope.lane) {
        Some(lane_tx) => {
            if lane_tx.send(assignment).await.is_err() {
                error!(jobid, lane = %envelope.lane, "lane queue closed, job dropped");
            }
        }
        None => error!(jobid, lane = %envelope.lane, "no queue for fallback lane"),
    }

    counter.max(jobcounter)
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
