//! HTTP client for forwarding requests to targets

use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, Error as ClientError};
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use super::{POOL_IDLE_TIMEOUT_SECS, POOL_MAX_IDLE_PER_HOST};
use crate::hooks::OutboundOptions;
use crate::{Result, StenoError};

/// Pooled HTTP/1.1 client for upstream targets, over TLS for `https` URIs
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    /// Create a new HTTP client trusting the webpki root certificates
    ///
    /// # Errors
    ///
    /// Returns error if the TLS configuration cannot be built
    pub fn new() -> Result<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|e| StenoError::Other(format!("Failed to configure TLS: {e}")))?
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(connector);

        Ok(Self { client })
    }

    /// Build the upstream request described by `options`
    ///
    /// # Errors
    ///
    /// Returns error if the method or URI is invalid
    pub fn build_request(options: &OutboundOptions, body: Bytes) -> Result<Request<Full<Bytes>>> {
        let uri = build_uri(&options.scheme, &options.hostname, options.port, &options.path)?;

        let method = options.method.parse::<Method>().map_err(|e| {
            StenoError::Other(format!("Invalid HTTP method '{}': {e}", options.method))
        })?;

        let mut request = Request::new(Full::new(body));
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.headers_mut() = options.headers.to_header_map();
        Ok(request)
    }

    /// Send a request upstream, returning the response with its body unread
    ///
    /// # Errors
    ///
    /// Returns the client error; [`ClientError::is_connect`] marks an unreachable target
    pub async fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> std::result::Result<Response<Incoming>, ClientError> {
        debug!("Forwarding {} {}", request.method(), request.uri());
        self.client.request(request).await
    }
}

/// Build a URI from components
fn build_uri(scheme: &str, host: &str, port: u16, path: &str) -> Result<Uri> {
    let path = if path.starts_with('/') { path } else { "/" };
    let uri = format!("{scheme}://{host}:{port}{path}");

    uri.parse::<Uri>()
        .map_err(|e| StenoError::Other(format!("Invalid URI '{uri}': {e}")))
}
