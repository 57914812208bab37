//! Header-only streaming classification.
//!
//! Both sides of the bridge need to decide, before any body data is
//! read, whether a response is a single complete payload or an
//! incremental stream. The decision is derived from response headers
//! alone and is therefore an approximation: a complete response served
//! over `connection: keep-alive` without a `content-length` will be
//! misclassified as streaming. Callers that know better can bypass
//! [`classify`] and pick a [`StreamClass`] themselves.

use crate::envelope::Headers;

/// What the response headers claim about the body.
///
/// Everything except [`Complete`](StreamClass::Complete) and
/// [`Unknown`](StreamClass::Unknown) is treated as streaming
/// downstream; the finer-grained variant only selects the read framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Single buffered payload.
    Complete,
    /// `text/event-stream` body.
    EventStream,
    /// Chunked transfer encoding (or keep-alive with no length).
    Chunked,
    /// `multipart/*` body.
    Multipart,
    /// `application/x-ndjson` body.
    Ndjson,
    /// No usable signal; treated as complete so a producer never blocks
    /// waiting for a body that will not signal completion.
    Unknown,
}

/// How a streaming body is segmented into output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One record per line; used for event-stream and ndjson bodies.
    Lines,
    /// One record per transport read.
    Raw,
}

impl StreamClass {
    pub fn is_streaming(self) -> bool {
        !matches!(self, StreamClass::Complete | StreamClass::Unknown)
    }

    pub fn framing(self) -> Framing {
        match self {
            StreamClass::EventStream | StreamClass::Ndjson => Framing::Lines,
            _ => Framing::Raw,
        }
    }
}

/// Classify a response from its headers.
///
/// Precedence, first match wins:
/// 1. `content-type` contains `text/event-stream`
/// 2. `transfer-encoding` contains `chunked`
/// 3. `content-type` contains `multipart/`
/// 4. `content-type` contains `application/x-ndjson`
/// 5. `connection` is `keep-alive` and `content-length` is absent
///    (classified as [`StreamClass::Chunked`])
///
/// Otherwise [`StreamClass::Complete`] when a non-zero `content-length`
/// is present, else [`StreamClass::Unknown`].
pub fn classify(headers: &Headers) -> StreamClass {
    let content_type = headers.get("content-type").unwrap_or("").to_ascii_lowercase();
    let transfer_encoding = headers
        .get("transfer-encoding")
        .unwrap_or("")
        .to_ascii_lowercase();
    let connection = headers.get("connection").unwrap_or("").to_ascii_lowercase();
    let content_length = headers.get("content-length");

    if content_type.contains("text/event-stream") {
        StreamClass::EventStream
    } else if transfer_encoding.contains("chunked") {
        StreamClass::Chunked
    } else if content_type.contains("multipart/") {
        StreamClass::Multipart
    } else if content_type.contains("application/x-ndjson") {
        StreamClass::Ndjson
    } else if connection == "keep-alive" && content_length.is_none() {
        StreamClass::Chunked
    } else if content_length.is_some_and(|len| len != "0" && !len.is_empty()) {
        StreamClass::Complete
    } else {
        StreamClass::Unknown
    }
}
