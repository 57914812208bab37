//! Consumer side of the bridge: submit, poll, merge, terminate.
//!
//! [`Bridge::send`] submits one envelope to the queue platform, waits
//! for the job's response descriptor, and then reconstructs the
//! original response: either a single buffered payload or a lazy,
//! single-consumption byte stream with the same shape the direct
//! streaming response would have had.
//!
//! Ordering precondition: the platform delivers output records in the
//! order the producer emitted them. The reconstructor preserves that
//! order across polls and never re-sorts; it only defends against
//! records being *re-sent* (see [`fresh_outputs`]).

use crate::classify::classify;
use crate::config::BridgeConfig;
use crate::envelope::{Headers, RequestEnvelope, ResponseEnvelope};
use crate::queue::{JobOutput, JobStatus, PollBatch, QueueApi, Submission};
use crate::{BoxStream, Error, Result};
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Body of a reconstructed response, decided from the first poll.
pub enum Body {
    /// The whole payload, already assembled.
    Buffered(Bytes),
    /// A lazy, single-consumption sequence of body fragments. Dropping
    /// it stops the underlying poll loop.
    Streaming(BoxStream<'static, Bytes>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Body::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Body::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// A response reconstructed from a job's output records.
#[derive(Debug)]
pub struct BridgedResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Body,
}

impl BridgedResponse {
    fn from_envelope(envelope: ResponseEnvelope) -> Self {
        Self {
            status_code: envelope.status_code,
            headers: envelope.headers,
            body: Body::Buffered(envelope.body.unwrap_or_default()),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Streaming(_))
    }

    /// The body as one stream regardless of how it was reconstructed.
    pub fn into_body_stream(self) -> BoxStream<'static, Bytes> {
        match self.body {
            Body::Buffered(bytes) => Box::pin(stream::iter([Ok(bytes)])),
            Body::Streaming(inner) => inner,
        }
    }

    /// Collect the whole body, streaming or not.
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            Body::Buffered(bytes) => Ok(bytes),
            Body::Streaming(inner) => {
                let parts: Vec<Bytes> = inner.try_collect().await?;
                Ok(parts.concat().into())
            }
        }
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Poll one job, absorbing transient transport failures with capped
/// exponential backoff. Retries always reuse the same job id; a failed
/// poll never resubmits the job.
async fn poll_with_retry(
    queue: &Arc<dyn QueueApi>,
    job_id: &str,
    config: &BridgeConfig,
) -> Result<PollBatch> {
    let mut attempt = 0u32;
    loop {
        match queue.poll(job_id).await {
            Ok(batch) => return Ok(batch),
            Err(e) if e.is_retryable() && attempt < config.max_poll_retries => {
                let delay = config.backoff(attempt);
                warn!(job_id, attempt, error = %e, "transient poll failure, backing off");
                sleep(delay).await;
                attempt += 1;
            }
            Err(Error::Transport(source)) => {
                return Err(Error::Poll {
                    job_id: job_id.to_string(),
                    attempts: attempt + 1,
                    source,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drop the already-consumed prefix when the platform re-sends
/// accumulated output instead of draining it.
///
/// The expected delivery mode is incremental (each poll returns only
/// records produced since the last one), but some platform revisions
/// return the full accumulated history every time. The first record of
/// a job is always the response descriptor and never recurs in
/// incremental mode, so a batch that *starts* with a descriptor after
/// one was already consumed is a cumulative re-send; its first
/// `consumed` records are skipped.
fn fresh_outputs(batch: Vec<JobOutput>, consumed: &mut usize) -> Vec<JobOutput> {
    let cumulative = *consumed > 0 && matches!(batch.first(), Some(JobOutput::Descriptor(_)));
    let fresh: Vec<JobOutput> = if cumulative {
        if batch.len() <= *consumed {
            Vec::new()
        } else {
            batch.into_iter().skip(*consumed).collect()
        }
    } else {
        batch
    };
    *consumed += fresh.len();
    fresh
}

struct StreamState {
    queue: Arc<dyn QueueApi>,
    config: BridgeConfig,
    job_id: String,
    status: JobStatus,
    pending: VecDeque<JobOutput>,
    consumed: usize,
    last_progress: Instant,
    done: bool,
}

/// The lazy body of a streaming response: drains records already
/// received, then keeps polling until the job reaches a terminal
/// status. Each yielded item is one body fragment; a failure yields a
/// final error item so callers can always tell a clean end from a
/// truncated one.
fn poll_stream(state: StreamState) -> BoxStream<'static, Bytes> {
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(output) = st.pending.pop_front() {
                match output {
                    JobOutput::Fragment(text) => return Some((Ok(Bytes::from(text)), st)),
                    JobOutput::Error { error } => {
                        let status = if st.status.is_failure() {
                            st.status
                        } else {
                            JobStatus::Failed
                        };
                        st.pending.clear();
                        st.done = true;
                        return Some((Err(Error::Application { status, payload: error }), st));
                    }
                    JobOutput::Descriptor(_) => {
                        st.pending.clear();
                        st.done = true;
                        return Some((
                            Err(Error::Protocol(
                                "unexpected second response descriptor".into(),
                            )),
                            st,
                        ));
                    }
                }
            }
            if st.done {
                return None;
            }
            if st.status == JobStatus::Completed {
                debug!(job_id = %st.job_id, "stream complete");
                return None;
            }
            if st.status.is_failure() {
                st.done = true;
                return Some((
                    Err(Error::Application {
                        status: st.status,
                        payload: serde_json::Value::Null,
                    }),
                    st,
                ));
            }
            if st.last_progress.elapsed() >= st.config.idle_timeout {
                st.done = true;
                let waited = st.last_progress.elapsed();
                return Some((
                    Err(Error::Timeout {
                        job_id: st.job_id.clone(),
                        waited,
                    }),
                    st,
                ));
            }
            match poll_with_retry(&st.queue, &st.job_id, &st.config).await {
                Ok(batch) => {
                    st.status = batch.status;
                    let fresh = fresh_outputs(batch.outputs, &mut st.consumed);
                    if fresh.is_empty() {
                        if !st.status.is_terminal() {
                            sleep(st.config.poll_interval).await;
                        }
                    } else {
                        st.last_progress = Instant::now();
                        st.pending.extend(fresh);
                    }
                }
                Err(e) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
            }
        }
    }))
}

/// Consumer-side entry point: turns envelopes into reconstructed
/// responses by way of the queue platform.
pub struct Bridge {
    queue: Arc<dyn QueueApi>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(queue: impl QueueApi + 'static, config: BridgeConfig) -> Self {
        Self {
            queue: Arc::new(queue),
            config,
        }
    }

    /// Ask the platform to abandon a job. Dropping a streaming body
    /// already stops the poll loop; this additionally releases the
    /// producer side early.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        self.queue.cancel(job_id).await
    }

    /// Bridge one request: submit, await the descriptor, reconstruct.
    ///
    /// A rejected submission is returned to the caller unchanged as a
    /// buffered response; it is not a streaming failure.
    pub async fn send(&self, request: RequestEnvelope) -> Result<BridgedResponse> {
        request.validate()?;
        // No job exists yet, so a transport failure here is a
        // submission failure, not something to retry.
        let submission = self.queue.submit(&request).await.map_err(|e| match e {
            Error::Transport(source) => Error::Submission(source.to_string()),
            other => other,
        })?;
        let id = match submission {
            Submission::Rejected(envelope) => {
                return Ok(BridgedResponse::from_envelope(envelope))
            }
            Submission::Accepted { id } => id,
        };

        // Wait for the first output record: the response descriptor.
        // IN_QUEUE polls are not paced, only bounded.
        let started = Instant::now();
        let mut consumed = 0usize;
        let mut pending: VecDeque<JobOutput> = VecDeque::new();
        let mut status;
        loop {
            let batch = poll_with_retry(&self.queue, &id, &self.config).await?;
            status = batch.status;
            pending.extend(fresh_outputs(batch.outputs, &mut consumed));
            if !pending.is_empty() || status.is_terminal() {
                break;
            }
            if started.elapsed() >= self.config.queue_wait {
                return Err(Error::Timeout {
                    job_id: id,
                    waited: started.elapsed(),
                });
            }
            if status == JobStatus::InProgress {
                sleep(self.config.poll_interval).await;
            }
        }

        let descriptor = match pending.pop_front() {
            Some(JobOutput::Descriptor(envelope)) => envelope,
            Some(JobOutput::Error { error }) => {
                return Err(Error::Application {
                    status: if status.is_failure() { status } else { JobStatus::Failed },
                    payload: error,
                })
            }
            Some(JobOutput::Fragment(_)) => {
                return Err(Error::Protocol(
                    "first output record is not a response descriptor".into(),
                ))
            }
            None => {
                return Err(match status {
                    JobStatus::Completed => Error::Protocol(
                        "job completed without producing a response descriptor".into(),
                    ),
                    status => Error::Application {
                        status,
                        payload: serde_json::Value::Null,
                    },
                })
            }
        };

        let class = classify(&descriptor.headers);
        debug!(job_id = %id, ?class, status = %status, "descriptor received");

        if !class.is_streaming() {
            return self
                .buffer_remaining(id, descriptor, status, pending, consumed)
                .await;
        }

        let state = StreamState {
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            job_id: id,
            status,
            pending,
            consumed,
            last_progress: Instant::now(),
            done: false,
        };
        Ok(BridgedResponse {
            status_code: descriptor.status_code,
            headers: descriptor.headers,
            body: Body::Streaming(poll_stream(state)),
        })
    }

    /// Non-streaming reconstruction: concatenate fragments until the
    /// job completes, then hand back one buffered response. When the
    /// first poll already observed `COMPLETED`, no further poll is made.
    async fn buffer_remaining(
        &self,
        id: String,
        descriptor: ResponseEnvelope,
        mut status: JobStatus,
        mut pending: VecDeque<JobOutput>,
        mut consumed: usize,
    ) -> Result<BridgedResponse> {
        let mut body = Vec::new();
        if let Some(bytes) = &descriptor.body {
            body.extend_from_slice(bytes);
        }
        let mut last_progress = Instant::now();
        loop {
            while let Some(output) = pending.pop_front() {
                match output {
                    JobOutput::Fragment(text) => {
                        body.extend_from_slice(text.as_bytes());
                        last_progress = Instant::now();
                    }
                    JobOutput::Error { error } => {
                        return Err(Error::Application {
                            status: if status.is_failure() { status } else { JobStatus::Failed },
                            payload: error,
                        })
                    }
                    JobOutput::Descriptor(_) => {
                        return Err(Error::Protocol(
                            "unexpected second response descriptor".into(),
                        ))
                    }
                }
            }
            if status == JobStatus::Completed {
                break;
            }
            if status.is_failure() {
                return Err(Error::Application {
                    status,
                    payload: serde_json::Value::Null,
                });
            }
            if last_progress.elapsed() >= self.config.idle_timeout {
                return Err(Error::Timeout {
                    job_id: id,
                    waited: last_progress.elapsed(),
                });
            }
            sleep(self.config.poll_interval).await;
            let batch = poll_with_retry(&self.queue, &id, &self.config).await?;
            status = batch.status;
            pending.extend(fresh_outputs(batch.outputs, &mut consumed));
        }
        Ok(BridgedResponse {
            status_code: descriptor.status_code,
            headers: descriptor.headers,
            body: Body::Buffered(body.into()),
        })
    }
}
