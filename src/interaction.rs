//! Wire types shared by recording and replay
//!
//! A [`RequestInfo`] and the [`ResponseInfo`] answering it form an
//! [`Interaction`], tagged with the [`Direction`] the request travelled and its
//! position in the recording.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use hyper::header::{HeaderMap, HeaderName};
use hyper::{StatusCode, Version};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Result, StenoError};

/// Correlation id linking a request to its response
pub type RequestId = Uuid;

/// Which way a request travelled through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Originated by the external service, destined for the application
    Incoming,
    /// Originated by the application, destined for the external service
    Outgoing,
}

impl Direction {
    /// Label used in cassette file names
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = StenoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(StenoError::InvalidFormat(format!(
                "Unknown direction '{other}'"
            ))),
        }
    }
}

/// A header value: one string, or an ordered list for repeated headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Header seen once
    Single(String),
    /// Header seen several times, in arrival order
    Multi(Vec<String>),
}

impl HeaderValue {
    /// Parse the textual form used in cassette files
    #[must_use]
    pub fn parse_wire(value: &str) -> Self {
        if value.contains(", ") {
            HeaderValue::Multi(value.split(", ").map(str::to_string).collect())
        } else {
            HeaderValue::Single(value.to_string())
        }
    }

    /// Textual form used in cassette files
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            HeaderValue::Single(v) => v.clone(),
            HeaderValue::Multi(vs) => vs.join(", "),
        }
    }

    /// Individual values, splitting a single value on `", "`
    #[must_use]
    pub fn split_values(&self) -> Vec<&str> {
        match self {
            HeaderValue::Single(v) => v.split(", ").collect(),
            HeaderValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    /// Individual values without splitting
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValue::Single(v) => vec![v.as_str()],
            HeaderValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    /// Promote to a list
    #[must_use]
    pub fn into_multi(self) -> Self {
        match self {
            HeaderValue::Single(v) => HeaderValue::Multi(vec![v]),
            multi @ HeaderValue::Multi(_) => multi,
        }
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(first) => {
                *self = HeaderValue::Multi(vec![std::mem::take(first), value]);
            }
            HeaderValue::Multi(vs) => vs.push(value),
        }
    }
}

impl Serialize for HeaderValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            HeaderValue::Single(v) => serializer.serialize_str(v),
            HeaderValue::Multi(vs) => vs.serialize(serializer),
        }
    }
}

/// Ordered header multimap with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    /// Create an empty header map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert from a hyper header map, folding repeated names into lists
    #[must_use]
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers.append(name.as_str(), value);
        }
        headers
    }

    /// Convert to a hyper header map, skipping names or values hyper rejects
    #[must_use]
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!("Skipping invalid header name: {}", name);
                continue;
            };
            for v in value.values() {
                match hyper::header::HeaderValue::from_str(v) {
                    Ok(hv) => {
                        map.append(header_name.clone(), hv);
                    }
                    Err(_) => debug!("Skipping invalid value for header {}", name),
                }
            }
        }
        map
    }

    /// Look up a header by name, ignoring case
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Set a header, replacing any existing value
    pub fn insert(&mut self, name: &str, value: HeaderValue) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Add a value, turning an existing header into a list
    pub fn append(&mut self, name: &str, value: String) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1.push(value);
        } else {
            self.entries
                .push((name.to_string(), HeaderValue::Single(value)));
        }
    }

    /// Remove a header, returning its value
    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    /// Iterate over headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Mutable iteration over values
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut HeaderValue> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    /// Number of distinct header names
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collapse every header to one string, joining lists with a space
    ///
    /// # Errors
    ///
    /// Returns error if a header holds an empty list
    pub fn flatten(&self) -> Result<BTreeMap<String, String>> {
        self.entries
            .iter()
            .map(|(name, value)| match value {
                HeaderValue::Single(v) => Ok((name.clone(), v.clone())),
                HeaderValue::Multi(vs) if vs.is_empty() => {
                    Err(StenoError::InvalidHeader(name.clone()))
                }
                HeaderValue::Multi(vs) => Ok((name.clone(), vs.join(" "))),
            })
            .collect()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value.to_string());
        }
        headers
    }
}

/// A fully read HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    /// Internal correlation id, never written to cassettes
    pub id: RequestId,
    /// HTTP method
    pub method: String,
    /// Path and query, as received
    pub url: String,
    /// HTTP version, e.g. `1.1`
    pub http_version: String,
    /// Request headers
    pub headers: Headers,
    /// Request body
    pub body: Option<Bytes>,
    /// Request trailers
    pub trailers: Option<Headers>,
}

impl RequestInfo {
    /// Body bytes, empty when absent
    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    /// Body as lossy UTF-8 text
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.body_bytes()).into_owned()
    }
}

/// A fully read HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseInfo {
    /// Id of the request this answers
    pub request_id: RequestId,
    /// HTTP version, e.g. `1.1`
    pub http_version: String,
    /// Status code
    pub status_code: u16,
    /// Reason phrase
    pub status_message: String,
    /// Response headers
    pub headers: Headers,
    /// Response body
    pub body: Option<Bytes>,
    /// Response trailers
    pub trailers: Option<Headers>,
}

impl ResponseInfo {
    /// Response synthesized when the upstream target refuses the connection
    #[must_use]
    pub fn bad_gateway(request_id: RequestId, target: &str) -> Self {
        let status = StatusCode::BAD_GATEWAY;
        Self {
            request_id,
            http_version: "1.1".to_string(),
            status_code: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            headers: Headers::new(),
            body: Some(Bytes::from(format!("Steno failed to connect to {target}"))),
            trailers: None,
        }
    }

    /// Body decoded per `content-encoding` and rendered as text
    ///
    /// The proxied bytes are never altered; this is for cassettes and reports.
    ///
    /// # Errors
    ///
    /// Returns error if a gzip or deflate body cannot be decoded
    pub fn body_text(&self) -> Result<Option<String>> {
        let Some(body) = self.body.as_deref() else {
            return Ok(None);
        };

        let encoding = self
            .headers
            .get("content-encoding")
            .map(HeaderValue::to_wire)
            .unwrap_or_default();

        let decoded = match encoding.trim().to_ascii_lowercase().as_str() {
            "gzip" => {
                let mut out = Vec::new();
                MultiGzDecoder::new(body).read_to_end(&mut out)?;
                out
            }
            "deflate" => {
                let mut out = Vec::new();
                ZlibDecoder::new(body).read_to_end(&mut out)?;
                out
            }
            _ => body.to_vec(),
        };

        Ok(Some(String::from_utf8_lossy(&decoded).into_owned()))
    }

    /// Body as text, falling back to the raw bytes if decoding fails
    #[must_use]
    pub fn display_body(&self) -> Option<String> {
        self.body_text().unwrap_or_else(|e| {
            warn!("Response body for {} left undecoded: {}", self.request_id, e);
            self.body
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
        })
    }
}

/// One recorded request/response exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    /// The request
    pub request: RequestInfo,
    /// The response answering it
    pub response: ResponseInfo,
    /// Which way the request travelled
    pub direction: Direction,
    /// Position in the recording (unix milliseconds at capture)
    pub timestamp: u64,
    /// When the request half was replayed
    pub request_timestamp: Option<u64>,
    /// When the response half was replayed
    pub response_timestamp: Option<u64>,
}

/// Milliseconds since the unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// HTTP version as written in request and status lines
#[must_use]
pub fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}
