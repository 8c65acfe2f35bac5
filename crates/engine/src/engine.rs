//! Engine assembly: channel wiring and task spawning.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::info;

use jobmill_core::store::JobStore;

use crate::api::{EngineConfig, EngineHandle};
use crate::client::JobClient;
use crate::{callback, collector, intake, lane, recovery, worker};

const INTAKE_QUEUE_DEPTH: usize = 64;
const COLLECTOR_QUEUE_DEPTH: usize = 256;
const LANE_QUEUE_DEPTH: usize = 1024;

pub(crate) async fn start_engine(mut config: EngineConfig) -> anyhow::Result<EngineHandle> {
    normalize(&mut config)?;

    let store = JobStore::open(&config.store_dir, config.lock_deadline)?;
    let swept = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.sweep_locks()).await??
    };
    if swept > 0 {
        info!(swept, "deleted leftover lock files");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (collector_tx, collector_rx) = mpsc::channel(COLLECTOR_QUEUE_DEPTH);
    let (callback_tx, callback_rx) = mpsc::unbounded_channel();

    let callbacks = tokio::spawn(callback::run_callbacks(
        callback_rx,
        config.side_channel.clone(),
    ));
    let collector = {
        let store = store.clone();
        let tz = config.timezone;
        let cache = config.status_cache;
        tokio::task::spawn_blocking(move || {
            collector::run_collector(collector_rx, store, tz, cache, callback_tx)
        })
    };

    let mut tasks = JoinSet::new();
    let mut lane_txs = HashMap::new();
    for spec in &config.lanes {
        let (lane_tx, lane_rx) = mpsc::channel(LANE_QUEUE_DEPTH);
        lane_txs.insert(spec.name.clone(), lane_tx);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut worker_txs = Vec::with_capacity(spec.workers);
        for worker_idx in 0..spec.workers {
            let (cmd_tx, cmd_rx) = mpsc::channel(1);
            worker_txs.push(cmd_tx);
            tasks.spawn(worker::run_worker(
                spec.name.clone(),
                worker_idx,
                cmd_rx,
                event_tx.clone(),
                collector_tx.clone(),
                config.registry.clone(),
                config.retry,
            ));
        }
        drop(event_tx);
        tasks.spawn(lane::run_dispatcher(
            spec.name.clone(),
            lane_rx,
            worker_txs,
            event_rx,
        ));
        info!(lane = %spec.name, workers = spec.workers, "lane started");
    }

    let (intake_tx, intake_rx) = mpsc::channel(INTAKE_QUEUE_DEPTH);
    tasks.spawn(intake::run_intake(
        intake_rx,
        collector_tx.clone(),
        lane_txs,
        config.timezone,
        stop_rx,
    ));

    let client = JobClient::new(intake_tx, collector_tx, store.clone());

    recovery::queue_interrupted_jobs(&client, &store, &config).await?;

    Ok(EngineHandle {
        client,
        stop_tx,
        tasks,
        collector,
        callbacks,
    })
}

fn normalize(config: &mut EngineConfig) -> anyhow::Result<()> {
    anyhow::ensure!(!config.lanes.is_empty(), "at least one lane is required");
    anyhow::ensure!(
        config
            .lanes
            .iter()
            .any(|lane| lane.name == EngineConfig::FALLBACK_LANE),
        "a {:?} lane is required as the fallback for unknown lanes",
        EngineConfig::FALLBACK_LANE
    );
    let mut names = std::collections::HashSet::new();
    for lane in &mut config.lanes {
        anyhow::ensure!(names.insert(lane.name.clone()), "duplicate lane {:?}", lane.name);
        if lane.workers == 0 {
            lane.workers = 1;
        }
    }
    if config.retry.delay_max < config.retry.delay_min {
        std::mem::swap(&mut config.retry.delay_min, &mut config.retry.delay_max);
    }
    if config.max_attempts == 0 {
        config.max_attempts = 1;
    }
    Ok(())
}
