//! Transport-agnostic request/response records.
//!
//! An envelope is what crosses the queue platform's JSON boundary: the
//! method, URL, headers, and body of a call, detached from any transport
//! type. Bodies are base64-encoded on the wire and decoded back to raw
//! bytes on the transport side. The codec never drops headers and never
//! injects ones the original call did not have.

use crate::{Error, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// An ordered multi-map of header names to values.
///
/// Order is preserved as received; lookups are case-insensitive per
/// RFC 9110. Serializes as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        Self(
            map.iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        )
    }

    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidEnvelope(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidEnvelope(format!("header value for {name:?}: {e}")))?;
            map.append(name, value);
        }
        Ok(map)
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Headers, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    entries.push((name, value));
                }
                Ok(Headers(entries))
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        body: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => STANDARD.encode(bytes).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// A serialized HTTP request, ready to cross the submission boundary.
///
/// Immutable once constructed: the `with_*` builders consume `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64", skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Reject envelopes that could never become a transport call.
    pub fn validate(&self) -> Result<()> {
        if self.method.trim().is_empty() {
            return Err(Error::InvalidEnvelope("missing method".into()));
        }
        if self.url.trim().is_empty() {
            return Err(Error::InvalidEnvelope("missing url".into()));
        }
        url::Url::parse(&self.url)
            .map_err(|e| Error::InvalidEnvelope(format!("url {:?}: {e}", self.url)))?;
        Ok(())
    }

    pub fn from_reqwest(request: &reqwest::Request) -> Self {
        Self {
            method: request.method().as_str().to_string(),
            url: request.url().to_string(),
            headers: Headers::from_header_map(request.headers()),
            body: request
                .body()
                .and_then(|b| b.as_bytes())
                .map(Bytes::copy_from_slice),
        }
    }

    /// Rebuild the transport request this envelope was derived from.
    pub fn to_reqwest(&self, client: &reqwest::Client) -> Result<reqwest::Request> {
        self.validate()?;
        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|e| Error::InvalidEnvelope(format!("method {:?}: {e}", self.method)))?;
        let url = url::Url::parse(&self.url)
            .map_err(|e| Error::InvalidEnvelope(format!("url {:?}: {e}", self.url)))?;
        let mut builder = client.request(method, url).headers(self.headers.to_header_map()?);
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
            .build()
            .map_err(Error::Transport)
    }
}

/// A serialized HTTP response: the first output record of every job.
///
/// The body is present only when the response was classified complete;
/// streaming bodies travel as separate fragment records instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64", skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestEnvelope>,
}

impl ResponseEnvelope {
    /// Status and headers only; what the emitter produces before the
    /// body has been drained.
    pub fn descriptor(status_code: u16, headers: Headers) -> Self {
        Self {
            status_code,
            headers,
            body: None,
            request: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_request(mut self, request: RequestEnvelope) -> Self {
        self.request = Some(request);
        self
    }
}
