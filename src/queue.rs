//! The queue platform's wire contract.
//!
//! The platform is an external collaborator: this module types its
//! submit/poll/cancel endpoints and nothing more. [`QueueApi`] is the
//! seam the reconstructor works against; [`HttpQueueClient`] is the
//! production implementation over `reqwest`.

use crate::envelope::{Headers, RequestEnvelope, ResponseEnvelope};
use crate::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Lifecycle of one job on the platform.
///
/// Monotonic: `IN_QUEUE` precedes `IN_PROGRESS`, and a terminal status
/// never changes once observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the endpoint queue for an available worker.
    InQueue,
    /// Actively being processed by a worker.
    InProgress,
    /// Finished successfully with a result.
    Completed,
    /// Errored during execution.
    Failed,
    /// Manually cancelled before completion.
    Cancelled,
    /// Expired in queue, or the worker failed to report in time.
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::InQueue | JobStatus::InProgress)
    }

    /// Terminal without a usable result.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobStatus::InQueue => "IN_QUEUE",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// One output record attributable to a job.
///
/// The first record of every job is the response [`Descriptor`]
/// (status and headers, body attached only for complete responses);
/// subsequent records are raw text fragments of the body. A job that
/// fails mid-stream carries the platform's failure payload as an
/// [`Error`] record.
///
/// [`Descriptor`]: JobOutput::Descriptor
/// [`Error`]: JobOutput::Error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Descriptor(ResponseEnvelope),
    Error { error: serde_json::Value },
    Fragment(String),
}

/// One poll reply: the job's status plus the output records made
/// available by this poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollBatch {
    pub status: JobStatus,
    pub outputs: Vec<JobOutput>,
}

/// Outcome of a submission attempt.
#[derive(Debug)]
pub enum Submission {
    /// The platform accepted the job and assigned an id.
    Accepted { id: String },
    /// The platform rejected the submission; the reply is handed back
    /// to the caller unchanged.
    Rejected(ResponseEnvelope),
}

/// The platform operations the reconstructor depends on.
#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn submit(&self, input: &RequestEnvelope) -> Result<Submission>;
    async fn poll(&self, job_id: &str) -> Result<PollBatch>;
    async fn cancel(&self, job_id: &str) -> Result<JobStatus>;
}

#[derive(Serialize)]
struct RunPayload<'a> {
    input: &'a RequestEnvelope,
}

#[derive(Deserialize)]
struct RunAck {
    id: String,
}

#[derive(Deserialize)]
struct StatusReply {
    #[allow(dead_code)]
    id: String,
    status: JobStatus,
}

#[derive(Deserialize)]
struct OutputRecord {
    output: JobOutput,
}

/// Job and worker counters reported by `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    pub jobs: JobCounters,
    pub workers: WorkerCounters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCounters {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    #[serde(rename = "timedOut")]
    pub timed_out: u64,
    #[serde(rename = "inQueue")]
    pub in_queue: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerCounters {
    pub idle: u64,
    pub running: u64,
}

static ENDPOINT_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/?(?P<version>v\d+)/(?P<endpoint>[A-Za-z0-9_-]+)(?P<path>/.*)$")
        .expect("endpoint path pattern")
});

/// Rewrite a caller-facing URL of the form `/{version}/{endpoint}/{path}`
/// so the embedded envelope addresses the wrapped application's `{path}`.
/// URLs that do not carry the platform prefix pass through unchanged.
pub fn app_url(url: &str) -> Result<String> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| Error::InvalidEnvelope(format!("url {url:?}: {e}")))?;
    if let Some(captures) = ENDPOINT_PATH.captures(parsed.path()) {
        let path = captures["path"].to_string();
        parsed.set_path(&path);
    }
    Ok(parsed.to_string())
}

/// `reqwest`-backed queue client.
///
/// Owns its transport: constructed explicitly and passed to the bridge,
/// never reached through ambient global state.
pub struct HttpQueueClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQueueClient {
    /// Build a client against the platform endpoint base URL
    /// (e.g. `https://api.example.com/v2/endpoint-id`).
    pub fn new(base_url: &str) -> Result<Self> {
        let timeout_secs = env::var("RUNBRIDGE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::Transport)?;
        Self::with_client(client, base_url)
    }

    /// Reuse an existing `reqwest::Client` (connection pool sharing).
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| Error::InvalidEnvelope(format!("base url {base_url:?}: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// `GET /status/{id}`: current status without draining output.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        let reply: StatusReply = self
            .client
            .get(self.endpoint(&format!("status/{job_id}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.status)
    }

    /// `GET /health`: endpoint-wide job and worker counters.
    pub async fn health(&self) -> Result<Health> {
        let health: Health = self
            .client
            .get(self.endpoint("health"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(health)
    }
}

fn parse_poll_reply(text: &str) -> Result<PollBatch> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("poll reply is not JSON: {e}")))?;
    let status = value
        .get("status")
        .ok_or_else(|| Error::Protocol("poll reply missing `status`".into()))?;
    let status: JobStatus = serde_json::from_value(status.clone())
        .map_err(|_| Error::Protocol(format!("unrecognized job status {status}")))?;
    let stream = value
        .get("stream")
        .ok_or_else(|| Error::Protocol("poll reply missing `stream`".into()))?;
    let records: Vec<OutputRecord> = serde_json::from_value(stream.clone())
        .map_err(|e| Error::Protocol(format!("malformed output records: {e}")))?;
    Ok(PollBatch {
        status,
        outputs: records.into_iter().map(|r| r.output).collect(),
    })
}

#[async_trait]
impl QueueApi for HttpQueueClient {
    async fn submit(&self, input: &RequestEnvelope) -> Result<Submission> {
        // A caller addressing the platform base keeps only the app path
        // inside the embedded envelope.
        let rewritten;
        let input = if input.url.starts_with(&self.base_url) {
            rewritten = RequestEnvelope {
                url: app_url(&input.url)?,
                ..input.clone()
            };
            &rewritten
        } else {
            input
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(%request_id, url = %input.url, "submitting job");
        let response = self
            .client
            .post(self.endpoint("run"))
            .header("x-request-id", &request_id)
            .json(&RunPayload { input })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let headers = Headers::from_header_map(response.headers());
            let body = response.bytes().await.unwrap_or_default();
            debug!(status, "submission rejected");
            let mut envelope = ResponseEnvelope::descriptor(status, headers);
            if !body.is_empty() {
                envelope = envelope.with_body(body);
            }
            return Ok(Submission::Rejected(envelope));
        }

        let text = response.text().await?;
        let ack: RunAck = serde_json::from_str(&text)
            .map_err(|_| Error::Protocol(format!("run reply missing job id: {text:?}")))?;
        debug!(job_id = %ack.id, "job accepted");
        Ok(Submission::Accepted { id: ack.id })
    }

    async fn poll(&self, job_id: &str) -> Result<PollBatch> {
        let response = self
            .client
            .post(self.endpoint(&format!("stream/{job_id}")))
            .send()
            .await?
            .error_for_status()?;
        let text = response.text().await?;
        let batch = parse_poll_reply(&text)?;
        debug!(job_id, status = %batch.status, outputs = batch.outputs.len(), "polled");
        Ok(batch)
    }

    async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        let reply: StatusReply = self
            .client
            .post(self.endpoint(&format!("cancel/{job_id}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(job_id, status = %reply.status, "cancelled");
        Ok(reply.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_uses_wire_names() {
        assert_eq!(serde_json::to_string(&JobStatus::InQueue).unwrap(), "\"IN_QUEUE\"");
        assert_eq!(serde_json::to_string(&JobStatus::TimedOut).unwrap(), "\"TIMED_OUT\"");
        let parsed: JobStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(parsed, JobStatus::InProgress);
    }

    #[test]
    fn terminal_and_failure_folds() {
        assert!(!JobStatus::InQueue.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Completed.is_failure());
        for status in [JobStatus::Failed, JobStatus::Cancelled, JobStatus::TimedOut] {
            assert!(status.is_terminal());
            assert!(status.is_failure());
        }
    }

    #[test]
    fn output_records_deserialize_by_shape() {
        let descriptor: JobOutput =
            serde_json::from_value(json!({"status_code": 200, "headers": {"content-type": "application/json"}}))
                .unwrap();
        assert!(matches!(descriptor, JobOutput::Descriptor(ref e) if e.status_code == 200));

        let fragment: JobOutput = serde_json::from_value(json!("{\"data\":0}")).unwrap();
        assert!(matches!(fragment, JobOutput::Fragment(ref s) if s == "{\"data\":0}"));

        let error: JobOutput = serde_json::from_value(json!({"error": "boom"})).unwrap();
        assert!(matches!(error, JobOutput::Error { .. }));
    }

    #[test]
    fn poll_reply_requires_status_and_stream() {
        let ok = parse_poll_reply(
            r#"{"status":"COMPLETED","stream":[{"output":"chunk"}]}"#,
        )
        .unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.outputs, vec![JobOutput::Fragment("chunk".into())]);

        let missing_status = parse_poll_reply(r#"{"stream":[]}"#).unwrap_err();
        assert!(matches!(missing_status, Error::Protocol(_)));

        let missing_stream = parse_poll_reply(r#"{"status":"IN_PROGRESS"}"#).unwrap_err();
        assert!(matches!(missing_stream, Error::Protocol(_)));

        let bad_status = parse_poll_reply(r#"{"status":"NOT_A_STATUS","stream":[]}"#).unwrap_err();
        assert!(matches!(bad_status, Error::Protocol(_)));

        let not_json = parse_poll_reply("<html>502</html>").unwrap_err();
        assert!(matches!(not_json, Error::Protocol(_)));
    }

    #[test]
    fn endpoint_prefix_is_stripped_from_app_urls() {
        let rewritten = app_url("https://api.example.com/v2/abc-123/stream_sse?x=1").unwrap();
        assert_eq!(rewritten, "https://api.example.com/stream_sse?x=1");

        // No platform prefix: unchanged.
        let plain = app_url("http://app.internal/json").unwrap();
        assert_eq!(plain, "http://app.internal/json");
    }

    #[test]
    fn health_counters_use_platform_casing() {
        let health: Health = serde_json::from_value(json!({
            "jobs": {"completed": 5, "failed": 1, "cancelled": 0, "timedOut": 2, "inQueue": 3, "retried": 0},
            "workers": {"idle": 1, "running": 4}
        }))
        .unwrap();
        assert_eq!(health.jobs.timed_out, 2);
        assert_eq!(health.jobs.in_queue, 3);
        assert_eq!(health.workers.running, 4);
    }
}
