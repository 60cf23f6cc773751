//! Extension points for rewriting traffic
//!
//! Two hook kinds exist. A [`Hook::RequestShaping`] adjusts where the outgoing
//! forwarder sends a request. A [`Hook::RawRequestTransform`] rewrites a request
//! just before it is written to a cassette, e.g. to redact credentials.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{authority, HostRewriteRule, RedactionConfig, Target};
use crate::interaction::{HeaderValue, Headers, RequestInfo};

/// Placeholder written in place of redacted data
pub const REDACTED: &str = "[REDACTED]";

/// Where and how a forwarded request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundOptions {
    /// URL scheme
    pub scheme: String,
    /// Hostname to connect to
    pub hostname: String,
    /// Port to connect to
    pub port: u16,
    /// HTTP method
    pub method: String,
    /// Path and query
    pub path: String,
    /// Outbound headers
    pub headers: Headers,
}

impl OutboundOptions {
    /// Options sending `request` unchanged to `target`
    #[must_use]
    pub fn for_target(target: &Target, request: &RequestInfo) -> Self {
        Self {
            scheme: target.scheme.clone(),
            hostname: target.host.clone(),
            port: target.port,
            method: request.method.clone(),
            path: request.url.clone(),
            headers: request.headers.clone(),
        }
    }

    /// Point an existing `host` header at the resolved hostname
    pub fn fix_host_header(&mut self) {
        if self.headers.get("host").is_some() {
            let host = authority(&self.scheme, &self.hostname, self.port);
            self.headers.insert("host", HeaderValue::Single(host));
        }
    }
}

/// Rewrites outbound options for a request about to be forwarded
pub type RequestShapingFn =
    Arc<dyn Fn(&RequestInfo, OutboundOptions) -> OutboundOptions + Send + Sync>;

/// Rewrites a request before it is serialized
pub type RawRequestTransformFn = Arc<dyn Fn(RequestInfo) -> RequestInfo + Send + Sync>;

/// A traffic rewriting hook
#[derive(Clone)]
pub enum Hook {
    /// Applied by the outgoing forwarder before a request is sent upstream
    RequestShaping(RequestShapingFn),
    /// Applied by the serializer before a request is written
    RawRequestTransform(RawRequestTransformFn),
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::RequestShaping(_) => f.write_str("Hook::RequestShaping"),
            Hook::RawRequestTransform(_) => f.write_str("Hook::RawRequestTransform"),
        }
    }
}

/// Ordered list of hooks; the first of each kind is the one used
#[derive(Debug, Clone, Default)]
pub struct Hooks(Vec<Hook>);

impl Hooks {
    /// Wrap an ordered hook list
    #[must_use]
    pub fn new(hooks: Vec<Hook>) -> Self {
        Self(hooks)
    }

    /// Hooks derived from configuration
    #[must_use]
    pub fn from_config(host_rewrites: &[HostRewriteRule], redaction: &RedactionConfig) -> Self {
        let mut hooks = Vec::new();
        if !host_rewrites.is_empty() {
            hooks.push(host_rewrite_hook(host_rewrites.to_vec()));
        }
        if !redaction.is_empty() {
            hooks.push(redaction_hook(redaction.clone()));
        }
        Self(hooks)
    }

    /// The request shaping hook, if any
    #[must_use]
    pub fn request_shaping(&self) -> Option<RequestShapingFn> {
        self.0.iter().find_map(|hook| match hook {
            Hook::RequestShaping(f) => Some(Arc::clone(f)),
            Hook::RawRequestTransform(_) => None,
        })
    }

    /// The raw request transform, if any
    #[must_use]
    pub fn raw_request_transform(&self) -> Option<RawRequestTransformFn> {
        self.0.iter().find_map(|hook| match hook {
            Hook::RawRequestTransform(f) => Some(Arc::clone(f)),
            Hook::RequestShaping(_) => None,
        })
    }
}

/// Send requests to another hostname based on their path prefix
#[must_use]
pub fn host_rewrite_hook(rules: Vec<HostRewriteRule>) -> Hook {
    Hook::RequestShaping(Arc::new(move |request, mut options| {
        if let Some(rule) = rules
            .iter()
            .find(|rule| request.url.starts_with(&rule.path_prefix))
        {
            options.hostname.clone_from(&rule.hostname);
        }
        options
    }))
}

/// Replace configured headers and literal secrets before serialization
#[must_use]
pub fn redaction_hook(config: RedactionConfig) -> Hook {
    Hook::RawRequestTransform(Arc::new(move |mut request| {
        for name in &config.headers {
            if request.headers.get(name).is_some() {
                request
                    .headers
                    .insert(name, HeaderValue::Single(REDACTED.to_string()));
            }
        }

        let secrets: Vec<&str> = config
            .secrets
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        if secrets.is_empty() {
            return request;
        }

        request.url = redact(&request.url, &secrets);
        for value in request.headers.values_mut() {
            let redacted = match &*value {
                HeaderValue::Single(v) => HeaderValue::Single(redact(v, &secrets)),
                HeaderValue::Multi(vs) => {
                    HeaderValue::Multi(vs.iter().map(|v| redact(v, &secrets)).collect())
                }
            };
            *value = redacted;
        }
        if let Some(body) = &request.body {
            if let Ok(text) = std::str::from_utf8(body) {
                request.body = Some(Bytes::from(redact(text, &secrets)));
            }
        }
        request
    }))
}

fn redact(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .fold(text.to_string(), |acc, secret| acc.replace(secret, REDACTED))
}
