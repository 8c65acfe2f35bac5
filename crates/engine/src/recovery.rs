//! Startup recovery: replay the journal directory.
//!
//! Every `.pkl` record is classified exactly once. Completed jobs past the
//! archive horizon move to `ARCHIVE/`; other terminal jobs re-register with
//! the collector; pending jobs get their attempt count bumped on disk and
//! are re-submitted through intake with their original identity, in
//! jobcounter order, after the counter has been seeded with the maximum
//! observed value.

use tracing::{info, warn};

use jobmill_core::clock::{archive_cutoff, is_before_cutoff};
use jobmill_core::job::{JobStatus, SubmitEnvelope};
use jobmill_core::store::{JobStore, StoreError};

use chrono::NaiveDateTime;

use crate::api::EngineConfig;
use crate::client::JobClient;

enum Disposition {
    Archived,
    Register {
        status: JobStatus,
        jobcounter: Option<u64>,
    },
    Restart {
        jobcounter: u64,
        envelope: SubmitEnvelope,
    },
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    restarted: usize,
    suppressed: usize,
    corrupted: usize,
    archived: usize,
}

pub(crate) async fn queue_interrupted_jobs(
    client: &JobClient,
    store: &JobStore,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let jobids = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.journal_ids()).await??
    };
    if jobids.is_empty() {
        return Ok(());
    }
    info!("reloading {} journaled jobs", jobids.len());

    let cutoff = archive_cutoff(config.timezone, config.archive_days);
    let max_attempts = config.max_attempts;

    let mut tally = Tally::default();
    let mut max_counter: u64 = 0;
    let mut restarts: Vec<(u64, String, SubmitEnvelope)> = Vec::new();

    for jobid in jobids {
        let disposition = {
            let store = store.clone();
            let jobid = jobid.clone();
            tokio::task::spawn_blocking(move || classify(&store, &jobid, max_attempts, cutoff))
                .await?
        };
        match disposition {
            Ok(Disposition::Archived) => tally.archived += 1,
            Ok(Disposition::Register { status, jobcounter }) => {
                if let Some(jobcounter) = jobcounter {
                    max_counter = max_counter.max(jobcounter);
                }
                match status {
                    JobStatus::Completed => tally.completed += 1,
                    JobStatus::Suppressed => tally.suppressed += 1,
                    _ => tally.corrupted += 1,
                }
                client.register(jobid, status).await?;
            }
            Ok(Disposition::Restart {
                jobcounter,
                envelope,
            }) => {
                max_counter = max_counter.max(jobcounter);
                restarts.push((jobcounter, jobid, envelope));
            }
            Err(err) => {
                warn!(jobid, "could not classify journal record: {err:#}");
                tally.corrupted += 1;
                client.register(jobid, JobStatus::Corrupted).await?;
            }
        }
    }

    client.set_jobcounter(max_counter).await?;

    restarts.sort_by_key(|(jobcounter, _, _)| *jobcounter);
    for (jobcounter, jobid, envelope) in restarts {
        info!(jobid, jobcounter, "re-queueing interrupted job");
        let ack = client.send_submit(envelope).await?;
        if ack.jobid != jobid {
            warn!(expected = jobid, confirmed = ack.jobid, "restart id mismatch");
        }
        tally.restarted += 1;
    }

    info!(
        completed = tally.completed,
        restarted = tally.restarted,
        suppressed = tally.suppressed,
        corrupted = tally.corrupted,
        archived = tally.archived,
        "journal replay finished"
    );
    Ok(())
}

fn classify(
    store: &JobStore,
    jobid: &str,
    max_attempts: u32,
    cutoff: NaiveDateTime,
) -> Result<Disposition, StoreError> {
    let record = match store.read_journal(jobid) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Ok(Disposition::Register {
                status: JobStatus::Corrupted,
                jobcounter: None,
            });
        }
        Err(err) => {
            warn!(jobid, "unreadable journal record: {err:#}");
            return Ok(Disposition::Register {
                status: JobStatus::Corrupted,
                jobcounter: None,
            });
        }
    };

    let metadata = match store.read_metadata(jobid) {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            warn!(jobid, "journaled job has no metadata");
            return Ok(Disposition::Register {
                status: JobStatus::Corrupted,
                jobcounter: None,
            });
        }
        Err(err) => {
            warn!(jobid, "unreadable metadata shelf: {err:#}");
            return Ok(Disposition::Register {
                status: JobStatus::Corrupted,
                jobcounter: None,
            });
        }
    };
    let jobcounter = metadata.jobcounter;

    if record.completed {
        if let Some(completed) = &metadata.times.completed {
            if is_before_cutoff(completed, cutoff) {
                let moved = store.archive_job(jobid)?;
                info!(jobid, moved, "archived completed job past the horizon");
                return Ok(Disposition::Archived);
            }
        }
        return Ok(Disposition::Register {
            status: JobStatus::Completed,
            jobcounter: Some(jobcounter),
        });
    }

    if record.attempts >= max_attempts {
        warn!(
            jobid,
            attempts = record.attempts,
            "job exceeded its replay budget, suppressing"
        );
        return Ok(Disposition::Register {
            status: JobStatus::Suppressed,
            jobcounter: Some(jobcounter),
        });
    }

    let mut record = record;
    record.attempts += 1;
    store.write_journal(jobid, &record)?;

    let mut envelope = record.request;
    envelope.restart_jobid = Some(jobid.to_string());
    envelope.restart_jobcounter = Some(jobcounter);
    envelope.restart_received = metadata.times.received.clone();

    Ok(Disposition::Restart {
        jobcounter,
        envelope,
    })
}
