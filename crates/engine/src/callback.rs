//! One-shot completion callbacks.
//!
//! Fire-and-forget: failures are logged and never retried, and never affect
//! the job's terminal status.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use jobmill_core::job::{CallbackMethod, EngineResult};

/// Delivery hook for callback URLs that should not go over raw HTTP.
///
/// URLs starting with the configured prefix are handed here instead of being
/// requested directly; what the prefix means is an application concern.
pub trait SideChannel: Send + Sync {
    /// Deliver `payload` to `url` with the requested method.
    fn dispatch(&self, url: &str, method: CallbackMethod, payload: &Value) -> anyhow::Result<()>;
}

/// A side-channel dispatcher and the URL prefix that selects it.
#[derive(Clone)]
pub struct SideChannelConfig {
    /// URLs starting with this prefix bypass raw HTTP.
    pub prefix: String,
    /// The dispatcher they are handed to.
    pub dispatcher: Arc<dyn SideChannel>,
}

pub(crate) struct CallbackJob {
    pub(crate) jobid: String,
    pub(crate) url: String,
    pub(crate) method: CallbackMethod,
    pub(crate) detailed: bool,
    pub(crate) result: EngineResult,
}

pub(crate) async fn run_callbacks(
    mut rx: mpsc::UnboundedReceiver<CallbackJob>,
    side_channel: Option<SideChannelConfig>,
) {
    let http = reqwest::Client::new();
    while let Some(job) = rx.recv().await {
        match deliver(&http, side_channel.as_ref(), &job).await {
            Ok(()) => debug!(jobid = %job.jobid, url = %job.url, "completion callback delivered"),
            Err(err) => warn!(
                jobid = %job.jobid,
                url = %job.url,
                "completion callback failed: {err:#}"
            ),
        }
    }
    debug!("callback dispatcher stopped");
}

async fn deliver(
    http: &reqwest::Client,
    side_channel: Option<&SideChannelConfig>,
    job: &CallbackJob,
) -> anyhow::Result<()> {
    let mut payload = json!({ "jobid": job.jobid });
    if job.detailed {
        let result_value: Value = serde_json::from_str(&job.result.json_result)
            .unwrap_or(Value::String(job.result.json_result.clone()));
        payload["status"] = json!(job.result.exec_status);
        payload["json_result"] = result_value;
    }

    if let Some(side) = side_channel {
        if job.url.starts_with(&side.prefix) {
            return side.dispatcher.dispatch(&job.url, job.method, &payload);
        }
    }

    let response = match job.method {
        CallbackMethod::Get => http.get(&job.url).query(&query_pairs(&payload)).send().await?,
        CallbackMethod::Post => http.post(&job.url).json(&payload).send().await?,
        CallbackMethod::Put => http.put(&job.url).json(&payload).send().await?,
    };
    anyhow::ensure!(
        response.status().is_success(),
        "callback returned http {}",
        response.status()
    );
    Ok(())
}

fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    payload
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), rendered)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmill_core::job::ExecStatus;

    #[test]
    fn query_pairs_render_strings_bare() {
        let payload = json!({ "jobid": "j-1", "json_result": {"k": 1} });
        let pairs = query_pairs(&payload);
        assert!(pairs.contains(&("jobid".to_string(), "j-1".to_string())));
        assert!(pairs.contains(&("json_result".to_string(), "{\"k\":1}".to_string())));
    }

    #[tokio::test]
    async fn side_channel_takes_prefixed_urls() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl SideChannel for Recorder {
            fn dispatch(
                &self,
                url: &str,
                _method: CallbackMethod,
                _payload: &Value,
            ) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(url.to_string());
                Ok(())
            }
        }

        let recorder = Arc::new(Recorder::default());
        let side = SideChannelConfig {
            prefix: "relay+".to_string(),
            dispatcher: recorder.clone(),
        };
        let http = reqwest::Client::new();
        let job = CallbackJob {
            jobid: "j-1".to_string(),
            url: "relay+https://example.test/done".to_string(),
            method: CallbackMethod::Post,
            detailed: false,
            result: EngineResult {
                exec_status: ExecStatus::Completed,
                json_result: "\"ok\"".to_string(),
                jobid: "j-1".to_string(),
            },
        };

        deliver(&http, Some(&side), &job).await.unwrap();
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            ["relay+https://example.test/done"]
        );
    }
}
