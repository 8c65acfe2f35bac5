//! Per-lane dispatchers: strict FIFO, handed to the first idle worker.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::worker::{JobAssignment, WorkerCommand};

pub(crate) async fn run_dispatcher(
    lane: String,
    mut rx: mpsc::Receiver<JobAssignment>,
    worker_txs: Vec<mpsc::Sender<WorkerCommand>>,
    mut events: mpsc::UnboundedReceiver<usize>,
) {
    let mut idle = vec![true; worker_txs.len()];
    let mut dead = vec![false; worker_txs.len()];
    let mut pending: VecDeque<JobAssignment> = VecDeque::new();
    let mut closing = false;

    loop {
        if closing && pending.is_empty() && idle.iter().zip(&dead).all(|(i, d)| *i || *d) {
            break;
        }

        tokio::select! {
            job = rx.recv(), if !closing => match job {
                Some(job) => pending.push_back(job),
                None => closing = true,
            },
            ev = events.recv() => match ev {
                Some(worker_idx) => {
                    if let Some(slot) = idle.get_mut(worker_idx) {
                        *slot = true;
                    }
                }
                // Every worker is gone; nothing left to dispatch to.
                None => break,
            },
        }

        assign(&lane, &mut pending, &mut idle, &mut dead, &worker_txs).await;
    }

    for (worker_idx, tx) in worker_txs.iter().enumerate() {
        if !dead[worker_idx] {
            let _ = tx.send(WorkerCommand::Stop).await;
        }
    }
    debug!(lane, "dispatcher stopped");
}

async fn assign(
    lane: &str,
    pending: &mut VecDeque<JobAssignment>,
    idle: &mut [bool],
    dead: &mut [bool],
    worker_txs: &[mpsc::Sender<WorkerCommand>],
) {
    while !pending.is_empty() {
        let Some(worker_idx) = (0..worker_txs.len()).find(|&i| idle[i] && !dead[i]) else {
            break;
        };
        let Some(job) = pending.pop_front() else {
            break;
        };

        idle[worker_idx] = false;
        match worker_txs[worker_idx].send(WorkerCommand::Run(job)).await {
            Ok(()) => {}
            Err(mpsc::error::SendError(cmd)) => {
                error!(lane, worker_idx, "worker channel closed, parking slot");
                dead[worker_idx] = true;
                if let WorkerCommand::Run(job) = cmd {
                    pending.push_front(job);
                }
            }
        }
    }
}
