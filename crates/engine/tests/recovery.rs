//! Recovery-path tests: journal replay, suppression, corruption, archival,
//! counter seeding, and durability across restarts.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, json};

use jobmill_core::clock::{DEFAULT_TIMEZONE, timestamp_now};
use jobmill_core::job::{
    JobMetadata, JobStatus, JobTimes, JournalRecord, RequestContext, SubmitEnvelope,
};
use jobmill_core::store::JobStore;
use jobmill_engine::{
    ActionRegistry, BuiltinRegistry, EngineConfig, LaneSpec, RegistryFactory, RetryPolicy,
    SubmitRequest, start_engine,
};

const WAIT: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(20);

fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir, Arc::new(BuiltinRegistry));
    config.lanes = vec![LaneSpec::new("slow", 1), LaneSpec::new("fast", 1)];
    config.retry = RetryPolicy {
        attempts: 1,
        delay_min: Duration::from_millis(1),
        delay_max: Duration::from_millis(5),
    };
    config
}

fn store_at(dir: &Path) -> JobStore {
    JobStore::open(dir, Duration::from_secs(5)).unwrap()
}

fn envelope(action: &str) -> SubmitEnvelope {
    SubmitEnvelope {
        action: action.to_string(),
        args: Vec::new(),
        kwargs: Map::new(),
        callback_url: None,
        callback_method: None,
        callback_detailed: false,
        request: RequestContext::default(),
        lane: "slow".to_string(),
        restart_jobid: None,
        restart_jobcounter: None,
        restart_received: None,
    }
}

fn metadata(action: &str, jobcounter: u64, times: JobTimes) -> JobMetadata {
    JobMetadata {
        jobcounter,
        action: action.to_string(),
        args: Vec::new(),
        kwargs: Map::new(),
        callback_url: None,
        callback_method: None,
        callback_detailed: false,
        request: RequestContext::default(),
        lane: "slow".to_string(),
        times,
    }
}

/// A registry whose `tick` action counts its invocations across engines.
#[derive(Clone)]
struct CountingFactory {
    calls: Arc<AtomicUsize>,
}

impl RegistryFactory for CountingFactory {
    fn open(&self) -> anyhow::Result<ActionRegistry> {
        let mut registry = ActionRegistry::with_builtins();
        let calls = self.calls.clone();
        registry.register("tick", move |_ctx, _args, _kwargs| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("tick"))
            })
        });
        Ok(registry)
    }
}

#[tokio::test]
async fn interrupted_job_is_replayed_with_its_identity() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());

    // The on-disk state an interrupted run leaves behind: a pending journal,
    // metadata with an assigned counter, and a leftover runtime lock.
    let received = timestamp_now(DEFAULT_TIMEZONE);
    store
        .write_journal(
            "job-int",
            &JournalRecord {
                request: envelope("helloworld"),
                attempts: 0,
                completed: false,
            },
        )
        .unwrap();
    store
        .write_metadata(
            "job-int",
            &metadata("helloworld", 7, JobTimes::received_at(received.clone())),
        )
        .unwrap();
    std::fs::write(dir.path().join("job-int.lock"), b"").unwrap();

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();

    let result = client.wait_for_result("job-int", WAIT, POLL).await.unwrap();
    assert_eq!(result, json!("HELLO time_=0 ([], {})"));

    // Identity, counter, and received stamp survived the replay.
    let reply = client.metadata("job-int").await.unwrap();
    let replayed = reply.metadata.unwrap();
    assert_eq!(replayed.jobcounter, 7);
    assert_eq!(replayed.times.received.as_deref(), Some(received.as_str()));

    // One replay was recorded and the journal is now complete.
    let journal = store.read_journal("job-int").unwrap().unwrap();
    assert_eq!(journal.attempts, 1);
    assert!(journal.completed);

    // The leftover lock was swept at startup and not recreated on restart...
    // until the collector re-created it for the replayed live job, which it
    // then removed at completion.
    assert!(!dir.path().join("job-int.lock").exists());

    // The counter was seeded past the replayed job.
    let fresh = client.submit(SubmitRequest::new("helloworld")).await.unwrap();
    client.wait_for_result(&fresh, WAIT, POLL).await.unwrap();
    let reply = client.metadata(&fresh).await.unwrap();
    assert_eq!(reply.metadata.unwrap().jobcounter, 8);

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn simulated_worker_crash_reruns_the_action_once() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        calls: calls.clone(),
    };

    let mut config = test_config(dir.path());
    config.registry = Arc::new(factory.clone());
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();
    let jobid = client.submit(SubmitRequest::new("tick")).await.unwrap();
    client.wait_for_result(&jobid, WAIT, POLL).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(client);
    engine.shutdown().await.unwrap();

    // Rewind the journal to the state a crash between `working` and
    // `publishing` leaves: the record exists but is not completed.
    let store = store_at(dir.path());
    let mut journal = store.read_journal(&jobid).unwrap().unwrap();
    journal.completed = false;
    store.write_journal(&jobid, &journal).unwrap();

    let mut config = test_config(dir.path());
    config.registry = Arc::new(factory);
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();
    client.wait_for_result(&jobid, WAIT, POLL).await.unwrap();

    // At-least-once: the action ran again, attempts grew by one.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let journal = store.read_journal(&jobid).unwrap().unwrap();
    assert_eq!(journal.attempts, 1);
    assert!(journal.completed);

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_replays_are_suppressed_without_running() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let store = store_at(dir.path());

    store
        .write_journal(
            "job-sup",
            &JournalRecord {
                request: envelope("tick"),
                attempts: 20,
                completed: false,
            },
        )
        .unwrap();
    store
        .write_metadata(
            "job-sup",
            &metadata(
                "tick",
                3,
                JobTimes::received_at(timestamp_now(DEFAULT_TIMEZONE)),
            ),
        )
        .unwrap();

    let mut config = test_config(dir.path());
    config.registry = Arc::new(CountingFactory {
        calls: calls.clone(),
    });
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();

    assert_eq!(
        client.status("job-sup").await.unwrap(),
        JobStatus::Suppressed
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Attempts are frozen once the job is suppressed.
    let journal = store.read_journal("job-sup").unwrap().unwrap();
    assert_eq!(journal.attempts, 20);

    let reply = client.result("job-sup").await.unwrap();
    assert_eq!(reply.status, JobStatus::Suppressed);
    assert!(reply.result.is_none());

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn journal_without_metadata_registers_as_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    store
        .write_journal(
            "job-cor",
            &JournalRecord {
                request: envelope("helloworld"),
                attempts: 0,
                completed: false,
            },
        )
        .unwrap();

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();

    assert_eq!(
        client.status("job-cor").await.unwrap(),
        JobStatus::Corrupted
    );

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn completed_results_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();
    let mut request = SubmitRequest::new("helloworld");
    request.args = vec![json!(0), json!("payload")];
    let jobid = client.submit(request).await.unwrap();
    let first = client.wait_for_result(&jobid, WAIT, POLL).await.unwrap();
    drop(client);
    engine.shutdown().await.unwrap();

    // Same store directory, fresh engine: same status, same bytes.
    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();
    assert_eq!(client.status(&jobid).await.unwrap(), JobStatus::Completed);
    let second = client.unpacked_result(&jobid).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second, json!("HELLO time_=0 ([\"payload\"], {})"));

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn counter_stays_monotonic_across_restarts() {
    let dir = tempfile::tempdir().unwrap();

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();
    for _ in 0..2 {
        let jobid = client.submit(SubmitRequest::new("helloworld")).await.unwrap();
        client.wait_for_result(&jobid, WAIT, POLL).await.unwrap();
    }
    drop(client);
    engine.shutdown().await.unwrap();

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();
    let jobid = client.submit(SubmitRequest::new("helloworld")).await.unwrap();
    client.wait_for_result(&jobid, WAIT, POLL).await.unwrap();
    let reply = client.metadata(&jobid).await.unwrap();
    assert_eq!(reply.metadata.unwrap().jobcounter, 3);

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_completed_jobs_are_archived_not_registered() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());

    // Far past any horizon.
    let mut stale_times = JobTimes::received_at("2020-01-01 08:00:00 PST".to_string());
    stale_times.completed = Some("2020-01-01 09:00:00 PST".to_string());
    store
        .write_journal(
            "job-old",
            &JournalRecord {
                request: envelope("helloworld"),
                attempts: 0,
                completed: true,
            },
        )
        .unwrap();
    store
        .write_metadata("job-old", &metadata("helloworld", 1, stale_times))
        .unwrap();

    // Completed just now: stays live.
    let mut fresh_times = JobTimes::received_at(timestamp_now(DEFAULT_TIMEZONE));
    fresh_times.completed = Some(timestamp_now(DEFAULT_TIMEZONE));
    store
        .write_journal(
            "job-new",
            &JournalRecord {
                request: envelope("helloworld"),
                attempts: 0,
                completed: true,
            },
        )
        .unwrap();
    store
        .write_metadata("job-new", &metadata("helloworld", 2, fresh_times))
        .unwrap();
    store
        .write_result(
            "job-new",
            &jobmill_core::job::EngineResult {
                exec_status: jobmill_core::job::ExecStatus::Completed,
                json_result: "\"kept\"".to_string(),
                jobid: "job-new".to_string(),
            },
        )
        .unwrap();

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();

    let ids = client.job_ids().await.unwrap();
    assert_eq!(ids, vec!["job-new".to_string()]);
    assert_eq!(client.status("job-old").await.unwrap(), JobStatus::Unknown);
    assert_eq!(
        client.status("job-new").await.unwrap(),
        JobStatus::Completed
    );

    assert!(dir.path().join("ARCHIVE/job-old.pkl").exists());
    assert!(dir.path().join("ARCHIVE/job-old.input").exists());
    assert!(!dir.path().join("job-old.pkl").exists());

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn completed_job_with_missing_result_registers_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());

    let mut times = JobTimes::received_at(timestamp_now(DEFAULT_TIMEZONE));
    times.completed = Some(timestamp_now(DEFAULT_TIMEZONE));
    store
        .write_journal(
            "job-hole",
            &JournalRecord {
                request: envelope("helloworld"),
                attempts: 0,
                completed: true,
            },
        )
        .unwrap();
    store
        .write_metadata("job-hole", &metadata("helloworld", 1, times))
        .unwrap();
    // No output shelf was ever written.

    let engine = start_engine(test_config(dir.path())).await.unwrap();
    let client = engine.client();

    assert_eq!(
        client.status("job-hole").await.unwrap(),
        JobStatus::Corrupted
    );

    drop(client);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn exception_jobs_replay_until_the_budget_runs_out() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = test_config(dir.path());
    config.max_attempts = 2;
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();
    let jobid = client
        .submit(SubmitRequest::new("no_such_action"))
        .await
        .unwrap();
    let wait = client.wait_for_result(&jobid, WAIT, POLL).await;
    assert!(wait.is_err());
    drop(client);
    engine.shutdown().await.unwrap();

    // Exceptions never mark the journal completed, so each restart replays
    // the job and bumps the attempt count.
    let store = store_at(dir.path());
    assert!(!store.read_journal(&jobid).unwrap().unwrap().completed);

    let mut config = test_config(dir.path());
    config.max_attempts = 2;
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();
    let wait = client.wait_for_result(&jobid, WAIT, POLL).await;
    assert!(wait.is_err());
    assert_eq!(store.read_journal(&jobid).unwrap().unwrap().attempts, 1);
    drop(client);
    engine.shutdown().await.unwrap();

    let mut config = test_config(dir.path());
    config.max_attempts = 2;
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();
    let wait = client.wait_for_result(&jobid, WAIT, POLL).await;
    assert!(wait.is_err());
    assert_eq!(store.read_journal(&jobid).unwrap().unwrap().attempts, 2);
    drop(client);
    engine.shutdown().await.unwrap();

    // Third restart: the budget (2) is exhausted, the job is suppressed.
    let mut config = test_config(dir.path());
    config.max_attempts = 2;
    let engine = start_engine(config).await.unwrap();
    let client = engine.client();
    assert_eq!(client.status(&jobid).await.unwrap(), JobStatus::Suppressed);
    assert_eq!(store.read_journal(&jobid).unwrap().unwrap().attempts, 2);

    drop(client);
    engine.shutdown().await.unwrap();
}
