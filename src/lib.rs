//! # runbridge
//!
//! Bridge between ordinary streaming HTTP responses and a submit/poll
//! serverless job queue.
//!
//! ## Overview
//!
//! A hosted application produces a live HTTP response (chunked transfer,
//! server-sent events, or newline-delimited JSON). A serverless queue
//! platform only knows how to run a job, accumulate discrete output
//! records, and hand them out one poll at a time. This crate implements
//! both halves of the bridge:
//!
//! - the **producer** side ([`Emitter`]) drives one request through the
//!   wrapped application and turns the response into a lazy sequence of
//!   job output records, and
//! - the **consumer** side ([`Bridge`]) submits a request, polls the
//!   job, and reconstructs a single ordered response that behaves like
//!   the direct streaming response would have.
//!
//! The two halves are connected only by the platform's wire contract
//! (`POST /run`, `POST|GET /stream/{id}`), modelled in [`queue`].
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`envelope`] | Transport-agnostic request/response records |
//! | [`classify`] | Header-only streaming classification |
//! | [`emit`] | Producer: response → job output records |
//! | [`reconstruct`] | Consumer: submit, poll, merge, terminate |
//! | [`queue`] | Queue platform wire contract and HTTP client |
//! | [`config`] | Owned bridge configuration |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runbridge::{Bridge, BridgeConfig, HttpQueueClient, RequestEnvelope};
//!
//! #[tokio::main]
//! async fn main() -> runbridge::Result<()> {
//!     let queue = HttpQueueClient::new("https://api.example.com/v2/endpoint-id")?;
//!     let bridge = Bridge::new(queue, BridgeConfig::default());
//!
//!     let request = RequestEnvelope::get("https://api.example.com/v2/endpoint-id/stream");
//!     let response = bridge.send(request).await?;
//!     let body = response.text().await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod emit;
pub mod envelope;
pub mod queue;
pub mod reconstruct;

// Re-export main types for convenience
pub use classify::{classify, Framing, StreamClass};
pub use config::BridgeConfig;
pub use emit::{App, AppResponse, Emitter, Handler, HttpApp};
pub use envelope::{Headers, RequestEnvelope, ResponseEnvelope};
pub use queue::{HttpQueueClient, JobOutput, JobStatus, PollBatch, QueueApi, Submission};
pub use reconstruct::{Body, Bridge, BridgedResponse};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::Error;
