//! Producer side of the bridge.
//!
//! [`Emitter`] drives one request through the wrapped application and
//! turns the live response into a lazy sequence of [`JobOutput`]
//! records: first the response descriptor, then one fragment per unit
//! of body data. Each unit is forwarded as soon as the transport hands
//! it over; the consumer only ever observes these through discrete
//! polls, so any buffering here would add end-to-end latency.
//!
//! The wrapped application is reached through the [`App`] trait; any
//! HTTP-serving component that can produce status and headers before
//! the body is drained satisfies it.

use crate::classify::{classify, Framing};
use crate::envelope::{Headers, RequestEnvelope, ResponseEnvelope};
use crate::queue::JobOutput;
use crate::{BoxStream, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// A response from the wrapped application with the body still lazy.
pub struct AppResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: BoxStream<'static, Bytes>,
}

/// The wrapped application boundary: one operation, transport-agnostic.
#[async_trait]
pub trait App: Send + Sync {
    /// Handle one request. Implementations must make status and headers
    /// available before the body is drained.
    async fn handle(&self, request: RequestEnvelope) -> Result<AppResponse>;
}

/// Adapts a live HTTP server to the [`App`] seam over `reqwest`.
pub struct HttpApp {
    client: reqwest::Client,
}

impl HttpApp {
    /// No overall request timeout: a streaming body may stay open for
    /// as long as the application keeps producing.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(Error::Transport)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl App for HttpApp {
    async fn handle(&self, request: RequestEnvelope) -> Result<AppResponse> {
        let transport_request = request.to_reqwest(&self.client)?;
        let response = self.client.execute(transport_request).await?;
        Ok(AppResponse {
            status: response.status().as_u16(),
            headers: Headers::from_header_map(response.headers()),
            body: Box::pin(response.bytes_stream().map_err(Error::Transport)),
        })
    }
}

enum EmitState {
    Start(Arc<dyn App>, RequestEnvelope),
    Body {
        body: BoxStream<'static, Bytes>,
        framing: Framing,
        buf: String,
    },
    Done,
}

/// Converts one request into the job output sequence the platform stores.
pub struct Emitter {
    app: Arc<dyn App>,
}

impl Emitter {
    pub fn new(app: impl App + 'static) -> Self {
        Self { app: Arc::new(app) }
    }

    /// Emit the output records for one request.
    ///
    /// The first record is always the full response descriptor; its body
    /// is attached only when the response classifies as complete. For
    /// streaming responses, subsequent records carry successive body
    /// units: one per line for event-stream/ndjson bodies, one per
    /// transport read otherwise. Line units keep their terminator so
    /// concatenating all fragments reconstitutes the body exactly.
    ///
    /// A malformed envelope or unreachable application fails fast with a
    /// single error item before any record is produced; a mid-body
    /// failure ends the sequence with an error item after the records
    /// already emitted. The response body is dropped, and its connection
    /// released, on every exit path.
    pub fn emit(&self, request: RequestEnvelope) -> BoxStream<'static, JobOutput> {
        let state = EmitState::Start(Arc::clone(&self.app), request);
        Box::pin(stream::unfold(state, |state| async move {
            match state {
                EmitState::Start(app, request) => {
                    if let Err(e) = request.validate() {
                        return Some((Err(e), EmitState::Done));
                    }
                    let response = match app.handle(request.clone()).await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(url = %request.url, error = %e, "application unreachable");
                            return Some((Err(e), EmitState::Done));
                        }
                    };

                    let class = classify(&response.headers);
                    debug!(status = response.status, ?class, "response classified");
                    let descriptor =
                        ResponseEnvelope::descriptor(response.status, response.headers.clone())
                            .with_request(request);

                    if class.is_streaming() {
                        let next = EmitState::Body {
                            body: response.body,
                            framing: class.framing(),
                            buf: String::new(),
                        };
                        Some((Ok(JobOutput::Descriptor(descriptor)), next))
                    } else {
                        // Complete response: drain the body now and ship
                        // it inside the descriptor.
                        let body: Bytes = match response.body.try_collect::<Vec<Bytes>>().await {
                            Ok(parts) => parts.concat().into(),
                            Err(e) => return Some((Err(e), EmitState::Done)),
                        };
                        let descriptor = if body.is_empty() {
                            descriptor
                        } else {
                            descriptor.with_body(body)
                        };
                        Some((Ok(JobOutput::Descriptor(descriptor)), EmitState::Done))
                    }
                }
                EmitState::Body {
                    mut body,
                    framing,
                    mut buf,
                } => loop {
                    if framing == Framing::Lines {
                        if let Some(pos) = buf.find('\n') {
                            let unit: String = buf.drain(..=pos).collect();
                            let next = EmitState::Body { body, framing, buf };
                            return Some((Ok(JobOutput::Fragment(unit)), next));
                        }
                    }
                    match body.next().await {
                        Some(Ok(bytes)) => {
                            if bytes.is_empty() {
                                continue;
                            }
                            let text = String::from_utf8_lossy(&bytes);
                            if framing == Framing::Lines {
                                buf.push_str(&text);
                                continue;
                            }
                            let next = EmitState::Body { body, framing, buf };
                            return Some((
                                Ok(JobOutput::Fragment(text.into_owned())),
                                next,
                            ));
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "body read failed mid-stream");
                            return Some((Err(e), EmitState::Done));
                        }
                        None => {
                            if buf.is_empty() {
                                return None;
                            }
                            // Unterminated tail line.
                            let rest = std::mem::take(&mut buf);
                            return Some((Ok(JobOutput::Fragment(rest)), EmitState::Done));
                        }
                    }
                },
                EmitState::Done => None,
            }
        }))
    }

    /// Lift this emitter into the [`Handler`] shape a worker registers.
    pub fn into_handler(self) -> Handler {
        Handler::AsyncSequence(Box::new(move |request| {
            let outputs = self.emit(request);
            Box::pin(outputs.map(|item| {
                item.and_then(|output| serde_json::to_value(output).map_err(Error::from))
            }))
        }))
    }
}

/// Job handler shapes accepted at registration time.
///
/// The shape is fixed when the handler is registered; call sites only
/// ever see the lifted stream form from [`Handler::run`].
pub enum Handler {
    /// One value, produced synchronously.
    Value(Box<dyn Fn(RequestEnvelope) -> Result<serde_json::Value> + Send + Sync>),
    /// A blocking iterator of values.
    Sequence(
        Box<
            dyn Fn(RequestEnvelope) -> Box<dyn Iterator<Item = serde_json::Value> + Send>
                + Send
                + Sync,
        >,
    ),
    /// An async stream of values.
    AsyncSequence(
        Box<dyn Fn(RequestEnvelope) -> BoxStream<'static, serde_json::Value> + Send + Sync>,
    ),
}

impl Handler {
    /// Run the handler, lifting every shape into one stream form.
    pub fn run(&self, request: RequestEnvelope) -> BoxStream<'static, serde_json::Value> {
        match self {
            Handler::Value(f) => Box::pin(stream::iter([f(request)])),
            Handler::Sequence(f) => Box::pin(stream::iter(f(request).map(Ok))),
            Handler::AsyncSequence(f) => f(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted in-memory application.
    struct ScriptedApp {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        parts: Vec<Result<&'static str>>,
        called: Arc<AtomicBool>,
    }

    impl ScriptedApp {
        fn new(
            status: u16,
            headers: &[(&'static str, &'static str)],
            parts: Vec<Result<&'static str>>,
        ) -> Self {
            Self {
                status,
                headers: headers.to_vec(),
                parts,
                called: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl App for ScriptedApp {
        async fn handle(&self, _request: RequestEnvelope) -> Result<AppResponse> {
            self.called.store(true, Ordering::SeqCst);
            let parts: Vec<Result<Bytes>> = self
                .parts
                .iter()
                .map(|part| match part {
                    Ok(text) => Ok(Bytes::from_static(text.as_bytes())),
                    Err(_) => Err(Error::Protocol("scripted failure".into())),
                })
                .collect();
            Ok(AppResponse {
                status: self.status,
                headers: self
                    .headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
                body: Box::pin(stream::iter(parts)),
            })
        }
    }

    async fn collect(emitter: &Emitter, request: RequestEnvelope) -> Vec<Result<JobOutput>> {
        emitter.emit(request).collect().await
    }

    #[tokio::test]
    async fn complete_response_is_one_descriptor_with_body() {
        let app = ScriptedApp::new(
            200,
            &[("content-type", "application/json"), ("content-length", "27")],
            vec![Ok("{\"message\":\"Hello, World!\"}")],
        );
        let emitter = Emitter::new(app);
        let outputs = collect(&emitter, RequestEnvelope::get("http://app.internal/json")).await;

        assert_eq!(outputs.len(), 1);
        match outputs.into_iter().next().unwrap().unwrap() {
            JobOutput::Descriptor(envelope) => {
                assert_eq!(envelope.status_code, 200);
                assert_eq!(
                    envelope.body.as_deref(),
                    Some("{\"message\":\"Hello, World!\"}".as_bytes())
                );
                let request = envelope.request.expect("originating request attached");
                assert_eq!(request.url, "http://app.internal/json");
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ndjson_body_is_split_into_line_fragments() {
        // Lines deliberately split across transport reads.
        let app = ScriptedApp::new(
            200,
            &[("content-type", "application/x-ndjson")],
            vec![Ok("{\"da"), Ok("ta\":0}\n{\"data\":1}\n"), Ok("{\"data\":2}\n")],
        );
        let emitter = Emitter::new(app);
        let outputs = collect(&emitter, RequestEnvelope::get("http://app.internal/stream")).await;

        let mut outputs = outputs.into_iter().map(|o| o.unwrap());
        match outputs.next().unwrap() {
            JobOutput::Descriptor(envelope) => {
                assert_eq!(envelope.status_code, 200);
                assert!(envelope.body.is_none(), "streaming descriptor carries no body");
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
        let fragments: Vec<String> = outputs
            .map(|o| match o {
                JobOutput::Fragment(s) => s,
                other => panic!("expected fragment, got {other:?}"),
            })
            .collect();
        assert_eq!(
            fragments,
            vec!["{\"data\":0}\n", "{\"data\":1}\n", "{\"data\":2}\n"]
        );
        // Concatenation reconstitutes the body exactly.
        assert_eq!(
            fragments.concat(),
            "{\"data\":0}\n{\"data\":1}\n{\"data\":2}\n"
        );
    }

    #[tokio::test]
    async fn chunked_body_yields_one_fragment_per_read() {
        let app = ScriptedApp::new(
            200,
            &[("transfer-encoding", "chunked")],
            vec![Ok("first "), Ok("second")],
        );
        let emitter = Emitter::new(app);
        let outputs = collect(&emitter, RequestEnvelope::get("http://app.internal/raw")).await;

        assert_eq!(outputs.len(), 3);
        assert!(matches!(outputs[0], Ok(JobOutput::Descriptor(_))));
        assert!(matches!(outputs[1], Ok(JobOutput::Fragment(ref s)) if s == "first "));
        assert!(matches!(outputs[2], Ok(JobOutput::Fragment(ref s)) if s == "second"));
    }

    #[tokio::test]
    async fn mid_stream_failure_stops_emission_after_delivered_output() {
        let app = ScriptedApp::new(
            200,
            &[("transfer-encoding", "chunked")],
            vec![Ok("partial"), Err(Error::Protocol("unused".into()))],
        );
        let emitter = Emitter::new(app);
        let outputs = collect(&emitter, RequestEnvelope::get("http://app.internal/raw")).await;

        assert_eq!(outputs.len(), 3);
        assert!(matches!(outputs[0], Ok(JobOutput::Descriptor(_))));
        assert!(matches!(outputs[1], Ok(JobOutput::Fragment(ref s)) if s == "partial"));
        assert!(outputs[2].is_err(), "emission must end with the error");
    }

    #[tokio::test]
    async fn malformed_envelope_fails_fast_without_reaching_the_app() {
        let app = ScriptedApp::new(200, &[], vec![]);
        let called = Arc::clone(&app.called);
        let emitter = Emitter::new(app);

        let outputs = collect(&emitter, RequestEnvelope::new("", "http://app.internal/")).await;
        assert_eq!(outputs.len(), 1);
        assert!(matches!(outputs[0], Err(Error::InvalidEnvelope(_))));
        assert!(!called.load(Ordering::SeqCst), "app must not be called");
    }

    #[tokio::test]
    async fn handler_shapes_lift_into_one_stream_form() {
        let value = Handler::Value(Box::new(|_| Ok(json!({"n": 1}))));
        let sequence = Handler::Sequence(Box::new(|_| {
            Box::new([json!(1), json!(2)].into_iter())
        }));
        let async_sequence = Handler::AsyncSequence(Box::new(|_| {
            Box::pin(stream::iter([Ok(json!("a")), Ok(json!("b"))]))
        }));

        let request = RequestEnvelope::get("http://app.internal/");
        let collected: Vec<serde_json::Value> = value
            .run(request.clone())
            .map(|v| v.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec![json!({"n": 1})]);

        let collected: Vec<serde_json::Value> = sequence
            .run(request.clone())
            .map(|v| v.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec![json!(1), json!(2)]);

        let collected: Vec<serde_json::Value> = async_sequence
            .run(request)
            .map(|v| v.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec![json!("a"), json!("b")]);
    }
}
