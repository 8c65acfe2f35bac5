//! The job model: lifecycle states, metadata, results, and journal records.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a job as tracked by the collector.
///
/// The happy path is `received → accepted → queued → working → publishing →
/// completed`, with `exception` replacing `completed` when the action fails.
/// `suppressed` and `corrupted` are terminal sinks reached only during
/// recovery, and `unknown` is the answer for ids the collector has never
/// seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The id is not known to the collector.
    Unknown,
    /// Intake has seen the submission.
    Received,
    /// Metadata has been recorded.
    Accepted,
    /// The job has been handed to its lane.
    Queued,
    /// A worker is executing the action.
    Working,
    /// The worker is shipping the result to the collector.
    Publishing,
    /// A result is durably stored.
    Completed,
    /// The action failed after retry exhaustion; the trace is the result.
    Exception,
    /// Replayed too many times after interrupted shutdowns.
    Suppressed,
    /// The durable record for this job can no longer be read.
    Corrupted,
}

impl JobStatus {
    /// Whether this state can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Exception
                | JobStatus::Suppressed
                | JobStatus::Corrupted
        )
    }

    /// The lowercase wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unknown => "unknown",
            JobStatus::Received => "received",
            JobStatus::Accepted => "accepted",
            JobStatus::Queued => "queued",
            JobStatus::Working => "working",
            JobStatus::Publishing => "publishing",
            JobStatus::Completed => "completed",
            JobStatus::Exception => "exception",
            JobStatus::Suppressed => "suppressed",
            JobStatus::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of executing an action on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// The action returned a value.
    Completed,
    /// The action failed; the result payload is the rendered error.
    Exception,
}

impl From<ExecStatus> for JobStatus {
    fn from(status: ExecStatus) -> Self {
        match status {
            ExecStatus::Completed => JobStatus::Completed,
            ExecStatus::Exception => JobStatus::Exception,
        }
    }
}

/// HTTP method used for the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallbackMethod {
    /// Payload as query parameters.
    Get,
    /// Payload as request body.
    Post,
    /// Payload as request body.
    Put,
}

impl fmt::Display for CallbackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackMethod::Get => f.write_str("GET"),
            CallbackMethod::Post => f.write_str("POST"),
            CallbackMethod::Put => f.write_str("PUT"),
        }
    }
}

/// Caller context captured at submission, for audit in the status table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Originating route, when the caller is an HTTP layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Originating handler function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// The original input payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Per-job timestamps, all rendered in the canonical format.
///
/// String fields stay `None` until the corresponding transition happens;
/// `runtime`/`turnaround` are computed once when both endpoints exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimes {
    /// When intake stamped the submission.
    #[serde(default)]
    pub received: Option<String>,
    /// First `working` transition.
    #[serde(default)]
    pub started: Option<String>,
    /// Most recent transition of any kind.
    #[serde(default)]
    pub updated: Option<String>,
    /// Terminal `completed` transition; set exactly once.
    #[serde(default)]
    pub completed: Option<String>,
    /// Human-readable `started → completed` span.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Human-readable `received → completed` span.
    #[serde(default)]
    pub turnaround: Option<String>,
    /// `started → completed` in whole seconds.
    #[serde(default)]
    pub runtime_sec: Option<i64>,
    /// `received → completed` in whole seconds.
    #[serde(default)]
    pub turnaround_sec: Option<i64>,
}

impl JobTimes {
    /// Times for a freshly received job.
    pub fn received_at(received: String) -> Self {
        JobTimes {
            received: Some(received),
            ..JobTimes::default()
        }
    }
}

/// The full metadata record written to a job's input shelf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Monotonic counter assigned at intake; orders replay on recovery.
    pub jobcounter: u64,
    /// Name of the action to run.
    pub action: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Completion callback target, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Completion callback method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_method: Option<CallbackMethod>,
    /// Whether the callback payload includes status and result.
    #[serde(default)]
    pub callback_detailed: bool,
    /// Caller context captured at submission.
    #[serde(default)]
    pub request: RequestContext,
    /// Lane the job was routed to.
    pub lane: String,
    /// Lifecycle timestamps.
    #[serde(default)]
    pub times: JobTimes,
}

/// The record written to a job's output shelf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    /// How execution ended.
    pub exec_status: ExecStatus,
    /// JSON-encoded return value, or the rendered error on exception.
    pub json_result: String,
    /// The job this result belongs to.
    pub jobid: String,
}

/// A submission as handed to intake.
///
/// The `restart_*` fields are populated only when recovery replays an
/// interrupted job; they carry the original identity and received time so
/// replays are indistinguishable from the first run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitEnvelope {
    /// Name of the action to run.
    pub action: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Completion callback target, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Completion callback method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_method: Option<CallbackMethod>,
    /// Whether the callback payload includes status and result.
    #[serde(default)]
    pub callback_detailed: bool,
    /// Caller context captured at submission.
    #[serde(default)]
    pub request: RequestContext,
    /// Requested lane; unknown lanes are rewritten to `slow`.
    pub lane: String,
    /// Identity to reuse instead of minting a fresh id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_jobid: Option<String>,
    /// Counter to reuse instead of issuing the next one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_jobcounter: Option<u64>,
    /// Received timestamp to reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_received: Option<String>,
}

/// The on-disk journal record: the ground truth of a job's existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// The original submission envelope, replayed on recovery.
    pub request: SubmitEnvelope,
    /// How many times this record has been replayed after an interrupted
    /// shutdown.
    #[serde(default)]
    pub attempts: u32,
    /// Whether a terminal result has been durably stored.
    #[serde(default)]
    pub completed: bool,
}

/// One row of the `status_all` summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusSummary {
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Intake counter, when metadata is readable.
    pub jobcounter: Option<u64>,
    /// Action name.
    pub action: Option<String>,
    /// Originating route.
    pub endpoint: Option<String>,
    /// Originating handler function.
    pub function: Option<String>,
    /// See [`JobTimes::received`].
    pub time_received: Option<String>,
    /// See [`JobTimes::started`].
    pub time_started: Option<String>,
    /// See [`JobTimes::runtime`].
    pub time_runtime: Option<String>,
    /// See [`JobTimes::updated`].
    pub time_updated: Option<String>,
    /// See [`JobTimes::completed`].
    pub time_completed: Option<String>,
    /// See [`JobTimes::turnaround`].
    pub time_turnaround: Option<String>,
    /// See [`JobTimes::runtime_sec`].
    pub time_runtime_sec: Option<i64>,
    /// See [`JobTimes::turnaround_sec`].
    pub time_turnaround_sec: Option<i64>,
    /// Lane the job ran on.
    pub lane: Option<String>,
}

impl JobStatusSummary {
    /// A summary row for a job whose metadata is unavailable.
    pub fn bare(status: JobStatus) -> Self {
        JobStatusSummary {
            status,
            jobcounter: None,
            action: None,
            endpoint: None,
            function: None,
            time_received: None,
            time_started: None,
            time_runtime: None,
            time_updated: None,
            time_completed: None,
            time_turnaround: None,
            time_runtime_sec: None,
            time_turnaround_sec: None,
            lane: None,
        }
    }

    /// A summary row built from a readable metadata record.
    pub fn from_metadata(status: JobStatus, metadata: &JobMetadata) -> Self {
        JobStatusSummary {
            status,
            jobcounter: Some(metadata.jobcounter),
            action: Some(metadata.action.clone()),
            endpoint: metadata.request.endpoint.clone(),
            function: metadata.request.function.clone(),
            time_received: metadata.times.received.clone(),
            time_started: metadata.times.started.clone(),
            time_runtime: metadata.times.runtime.clone(),
            time_updated: metadata.times.updated.clone(),
            time_completed: metadata.times.completed.clone(),
            time_turnaround: metadata.times.turnaround.clone(),
            time_runtime_sec: metadata.times.runtime_sec,
            time_turnaround_sec: metadata.times.turnaround_sec,
            lane: Some(metadata.lane.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Publishing).unwrap();
        assert_eq!(json, "\"publishing\"");
        let back: JobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(back, JobStatus::Completed);
    }

    #[test]
    fn terminal_states() {
        for status in [
            JobStatus::Completed,
            JobStatus::Exception,
            JobStatus::Suppressed,
            JobStatus::Corrupted,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            JobStatus::Received,
            JobStatus::Accepted,
            JobStatus::Queued,
            JobStatus::Working,
            JobStatus::Publishing,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn callback_method_serializes_uppercase() {
        let json = serde_json::to_string(&CallbackMethod::Put).unwrap();
        assert_eq!(json, "\"PUT\"");
        assert_eq!(CallbackMethod::Get.to_string(), "GET");
    }

    #[test]
    fn journal_record_round_trips() {
        let record = JournalRecord {
            request: SubmitEnvelope {
                action: "helloworld".to_string(),
                args: vec![serde_json::json!(1)],
                kwargs: Map::new(),
                callback_url: None,
                callback_method: None,
                callback_detailed: false,
                request: RequestContext::default(),
                lane: "slow".to_string(),
                restart_jobid: None,
                restart_jobcounter: None,
                restart_received: None,
            },
            attempts: 2,
            completed: false,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: JournalRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
