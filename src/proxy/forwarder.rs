//! Forwarder relaying one listener to one target

use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

use crate::config::Target;
use crate::hooks::{OutboundOptions, RequestShapingFn};
use crate::interaction::{now_millis, Headers, RequestId, RequestInfo, ResponseInfo};
use crate::network::{
    check_content_length, error_response, full, read_body, recorded_response, request_info,
    response_info, serve, ConnectionPool, HttpClient, Listener, ProxyBody, ServerHandle, TapBody,
};
use crate::{Result, StenoError};

/// What a forwarder observed
#[derive(Debug, Clone)]
pub enum ForwarderEvent {
    /// A request was fully read
    Request {
        /// The request as received
        request: RequestInfo,
        /// When the body finished arriving (unix milliseconds)
        observed_at: u64,
    },
    /// A response was fully read, or synthesized because the target refused
    Response(ResponseInfo),
    /// The exchange broke after the request was reported, other than by a
    /// refused connection; no response will follow
    Failure {
        /// Id of the request left without a response
        request_id: RequestId,
        /// What went wrong
        message: String,
    },
}

/// Relays requests to one target, emitting an event for each half
pub struct Forwarder {
    target: Target,
    request_shaping: Option<RequestShapingFn>,
    client: HttpClient,
    max_body_size: usize,
    events: UnboundedSender<ForwarderEvent>,
}

impl Forwarder {
    /// Create a forwarder for `target` and the receiver for its events
    ///
    /// # Errors
    ///
    /// Returns error if the upstream client cannot be built
    pub fn new(
        target: Target,
        request_shaping: Option<RequestShapingFn>,
        max_body_size: usize,
    ) -> Result<(Arc<Self>, UnboundedReceiver<ForwarderEvent>)> {
        let (events, rx) = unbounded_channel();
        let forwarder = Self {
            target,
            request_shaping,
            client: HttpClient::new()?,
            max_body_size,
            events,
        };
        Ok((Arc::new(forwarder), rx))
    }

    /// The target requests are sent to
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Serve on a bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the listener's local address cannot be read
    pub fn serve(
        self: &Arc<Self>,
        tcp: TcpListener,
        listener: Listener,
        pool: ConnectionPool,
    ) -> Result<ServerHandle> {
        let forwarder = Arc::clone(self);
        serve(tcp, listener, pool, move |req| {
            let forwarder = Arc::clone(&forwarder);
            async move { forwarder.handle(req).await }
        })
    }

    /// Forward one request and return the response to stream back
    ///
    /// # Errors
    ///
    /// Returns error if the body cannot be read or the upstream exchange fails
    /// after connecting
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        if let Err(e) = check_content_length(req.headers(), self.max_body_size) {
            warn!("Rejecting {} {}: {}", req.method(), req.uri(), e);
            return Ok(error_response(&e));
        }

        let (parts, body) = req.into_parts();
        let (body, trailers) = match read_body(body, self.max_body_size).await {
            Ok(read) => read,
            Err(e @ StenoError::DataTooLarge { .. }) => {
                warn!("Rejecting {} {}: {}", parts.method, parts.uri, e);
                return Ok(error_response(&e));
            }
            Err(e) => return Err(e),
        };

        let request = request_info(&parts, body.clone(), trailers.as_ref());
        debug!("{} {} -> {}", request.method, request.url, self.target);
        self.emit(ForwarderEvent::Request {
            request: request.clone(),
            observed_at: now_millis(),
        });

        let mut options = OutboundOptions::for_target(&self.target, &request);
        if let Some(shape) = &self.request_shaping {
            options = shape(&request, options);
        }
        options.fix_host_header();

        let upstream = HttpClient::build_request(&options, body)?;
        match self.client.send(upstream).await {
            Ok(response) => Ok(self.relay(request, response)),
            Err(e) if e.is_connect() => {
                let target = format!("{}://{}:{}", options.scheme, options.hostname, options.port);
                warn!("Target {} refused connection: {}", target, e);
                let response = ResponseInfo::bad_gateway(request.id, &target);
                let body = full(response.body.clone().unwrap_or_default());
                let reply = recorded_response(&response, body);
                self.emit(ForwarderEvent::Response(response));
                Ok(reply)
            }
            Err(e) => {
                error!("Upstream exchange with {} failed: {}", self.target, e);
                self.emit(ForwarderEvent::Failure {
                    request_id: request.id,
                    message: format!("{} {}: {e}", request.method, request.url),
                });
                Err(StenoError::Upstream(e.to_string()))
            }
        }
    }

    /// Stream an upstream response back, reporting it once fully read
    fn relay(&self, request: RequestInfo, response: Response<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = response.into_parts();
        let mut observed = response_info(&parts, request.id, Bytes::new(), None);

        let events = self.events.clone();
        let failures = self.events.clone();
        let target = self.target.clone();
        let tapped = TapBody::new(body, move |bytes, trailers| {
            observed.body = (!bytes.is_empty()).then_some(bytes);
            observed.trailers = trailers.as_ref().map(Headers::from_header_map);
            if events.send(ForwarderEvent::Response(observed)).is_err() {
                debug!("Response event dropped: no receiver");
            }
        })
        .on_failure(move |reason| {
            warn!(
                "Response to {} {} from {} not recorded: {}",
                request.method, request.url, target, reason
            );
            let failure = ForwarderEvent::Failure {
                request_id: request.id,
                message: format!("{} {}: {reason}", request.method, request.url),
            };
            if failures.send(failure).is_err() {
                debug!("Failure event dropped: no receiver");
            }
        });

        let mut reply = Response::new(tapped.boxed());
        *reply.status_mut() = parts.status;
        *reply.headers_mut() = parts.headers;
        reply
    }

    fn emit(&self, event: ForwarderEvent) {
        if self.events.send(event).is_err() {
            debug!("Forwarder event dropped: no receiver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostRewriteRule;
    use crate::hooks::{host_rewrite_hook, Hook};
    use crate::network::{bind, text_response};
    use http_body_util::Full;
    use hyper::StatusCode;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Upstream that echoes method, path and host
    async fn echo_upstream() -> ServerHandle {
        let tcp = bind(Listener::Outgoing, 0).await.unwrap();
        serve(tcp, Listener::Outgoing, ConnectionPool::new(8), |req: Request<Incoming>| async move {
            let host = req
                .headers()
                .get("host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let line = format!("{} {} {}", req.method(), req.uri().path(), host);
            let mut response = text_response(StatusCode::OK, line);
            response.headers_mut().append("set-cookie", "a=1".parse().unwrap());
            response.headers_mut().append("set-cookie", "b=2".parse().unwrap());
            Ok::<_, StenoError>(response)
        })
        .unwrap()
    }

    async fn start(
        target: Target,
        shaping: Option<RequestShapingFn>,
        max_body_size: usize,
    ) -> (ServerHandle, UnboundedReceiver<ForwarderEvent>) {
        let (forwarder, rx) = Forwarder::new(target, shaping, max_body_size).unwrap();
        let tcp = bind(Listener::Incoming, 0).await.unwrap();
        let handle = forwarder
            .serve(tcp, Listener::Incoming, ConnectionPool::new(8))
            .unwrap();
        (handle, rx)
    }

    async fn send(addr: SocketAddr, method: &str, path: &str, body: &str) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let request = Request::builder()
            .method(method)
            .uri(format!("http://127.0.0.1:{}{}", addr.port(), path))
            .body(Full::new(Bytes::copy_from_slice(body.as_bytes())))
            .unwrap();
        let response = client.request(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn local_target(handle: &ServerHandle) -> Target {
        Target::parse(&format!("http://127.0.0.1:{}", handle.local_addr().port())).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_and_emits_both_halves() {
        let upstream = echo_upstream().await;
        let target = local_target(&upstream);
        let (proxy, mut rx) = start(target.clone(), None, 1024).await;

        let (status, body) = send(proxy.local_addr(), "POST", "/api/test", "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("POST /api/test {}", target.authority()));

        let Some(ForwarderEvent::Request { request, observed_at }) = rx.recv().await else {
            panic!("expected request event");
        };
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/api/test");
        assert_eq!(request.body_text(), "hello");
        assert!(observed_at > 0);

        let Some(ForwarderEvent::Response(response)) = rx.recv().await else {
            panic!("expected response event");
        };
        assert_eq!(response.request_id, request.id);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status_message, "OK");
        assert_eq!(response.body_text().unwrap(), Some(body));
        assert_eq!(
            response.headers.get("set-cookie").map(|v| v.values().len()),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_refused_target_synthesizes_bad_gateway() {
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let target = Target::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let (proxy, mut rx) = start(target, None, 1024).await;

        let (status, body) = send(proxy.local_addr(), "GET", "/ping", "").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.starts_with("Steno failed to connect to http://127.0.0.1:"));

        assert!(matches!(rx.recv().await, Some(ForwarderEvent::Request { .. })));
        let Some(ForwarderEvent::Response(response)) = rx.recv().await else {
            panic!("expected response event");
        };
        assert_eq!(response.status_code, 502);
        assert_eq!(response.status_message, "Bad Gateway");
    }

    #[tokio::test]
    async fn test_request_shaping_rewrites_host() {
        let upstream = echo_upstream().await;
        let hook = host_rewrite_hook(vec![HostRewriteRule {
            path_prefix: "/services/".to_string(),
            hostname: "127.0.0.1".to_string(),
        }]);
        let Hook::RequestShaping(shaping) = hook else {
            panic!("expected request shaping hook");
        };

        let target = Target::parse(&format!(
            "http://steno-upstream.invalid:{}",
            upstream.local_addr().port()
        ))
        .unwrap();
        let (proxy, _rx) = start(target, Some(shaping), 1024).await;

        let (status, body) = send(proxy.local_addr(), "GET", "/services/hook", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            format!("GET /services/hook 127.0.0.1:{}", upstream.local_addr().port())
        );
    }

    /// Upstream that announces 100 bytes, sends three and hangs up
    async fn truncating_upstream() -> Target {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 1024];
            let _ = stream.read(&mut head).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nabc")
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        });
        Target::parse(&format!("http://127.0.0.1:{port}")).unwrap()
    }

    #[tokio::test]
    async fn test_truncated_upstream_body_reports_failure() {
        let (proxy, mut rx) = start(truncating_upstream().await, None, 1024).await;

        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let request = Request::get(format!("http://127.0.0.1:{}/partial", proxy.local_addr().port()))
            .body(Full::default())
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());

        let Some(ForwarderEvent::Request { request, .. }) = rx.recv().await else {
            panic!("expected request event");
        };
        let Some(ForwarderEvent::Failure { request_id, message }) = rx.recv().await else {
            panic!("expected failure event");
        };
        assert_eq!(request_id, request.id);
        assert!(message.starts_with("GET /partial: body failed"), "{message}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_without_forwarding() {
        let upstream = echo_upstream().await;
        let (proxy, mut rx) = start(local_target(&upstream), None, 4).await;

        let (status, _) = send(proxy.local_addr(), "POST", "/upload", "too large").await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(rx.try_recv().is_err());
    }
}
