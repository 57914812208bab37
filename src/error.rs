use crate::queue::JobStatus;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the bridge.
///
/// This aggregates both sides of the protocol into actionable categories.
/// Only [`Error::Poll`]-shaped transport failures are retried locally
/// (see [`Error::is_retryable`]); everything else propagates to the
/// caller as an explicit failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The request envelope was rejected before it ever reached the
    /// wrapped application or the platform (missing method/url, bad URL).
    #[error("invalid request envelope: {0}")]
    InvalidEnvelope(String),

    /// Submission failed before a job existed. Never retried.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// The wrapped application failed while the job was producing
    /// output. Output delivered before the failure is preserved.
    #[error("application failed with status {status}: {payload}")]
    Application {
        status: JobStatus,
        payload: serde_json::Value,
    },

    /// Polling the job failed repeatedly at the transport level.
    /// Retried with backoff against the same job id before surfacing.
    #[error("poll for job {job_id} failed after {attempts} attempts: {source}")]
    Poll {
        job_id: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// The job produced no output within the configured bound.
    #[error("job {job_id} produced no output within {waited:?}")]
    Timeout { job_id: String, waited: Duration },

    /// The platform returned a poll payload we cannot interpret.
    /// Fatal for the job, not retried.
    #[error("malformed poll payload: {0}")]
    Protocol(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the poll loop may retry after this error.
    ///
    /// Connection-level failures and 5xx replies are considered
    /// transient; anything structural (bad payload, terminal job
    /// status, rejected submission) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}
