//! HTTP helpers shared by the forwarder, replayer and control API

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::ext::ReasonPhrase;
use hyper::http::{request, response};
use hyper::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::interaction::{version_label, Headers, RequestId, RequestInfo, ResponseInfo};
use crate::{Result, StenoError};

/// Body type returned by every Steno listener
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A complete body from bytes
#[must_use]
pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// A plain text response
#[must_use]
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// A JSON response
#[must_use]
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode response: {e}"),
        ),
    }
}

/// A JSON error response with a `description`
#[must_use]
pub fn error_response(error: &StenoError) -> Response<ProxyBody> {
    let status = match error {
        StenoError::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StenoError::InvalidScenarioName(_) | StenoError::WrongMode { .. } => {
            StatusCode::BAD_REQUEST
        }
        StenoError::ScenarioNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    json_response(
        status,
        &json!({ "error": { "description": error.to_string() } }),
    )
}

/// A response with a recorded status and headers, sending `body`
///
/// A recorded `content-length` that disagrees with the recorded body is
/// dropped so hyper frames the body itself.
#[must_use]
pub fn recorded_response(info: &ResponseInfo, body: ProxyBody) -> Response<ProxyBody> {
    let mut headers = info.headers.to_header_map();
    let body_len = info.body.as_ref().map_or(0, Bytes::len);
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().parse::<usize>().ok());
    if matches!(declared, Some(len) if len != Some(body_len)) {
        headers.remove(CONTENT_LENGTH);
    }

    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(info.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *response.headers_mut() = headers;
    response
}

/// Reject a request whose declared length exceeds the limit
///
/// # Errors
///
/// Returns [`StenoError::DataTooLarge`] if `content-length` exceeds `max_size`
pub fn check_content_length(headers: &HeaderMap, max_size: usize) -> Result<()> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    match declared {
        Some(size) if size > max_size => Err(StenoError::DataTooLarge {
            size,
            limit: max_size,
        }),
        _ => Ok(()),
    }
}

/// Read a body to the end, with its trailers
///
/// Reading stops as soon as `max_size` is exceeded.
///
/// # Errors
///
/// Returns error if the body is too large or reading fails
pub async fn read_body<B>(body: B, max_size: usize) -> Result<(Bytes, Option<HeaderMap>)>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let announced = usize::try_from(body.size_hint().lower()).unwrap_or(usize::MAX);
    let collected = Limited::new(body, max_size).collect().await.map_err(|e| {
        if e.is::<LengthLimitError>() {
            StenoError::DataTooLarge {
                size: announced.max(max_size.saturating_add(1)),
                limit: max_size,
            }
        } else {
            StenoError::Other(format!("Failed to read body: {e}"))
        }
    })?;

    let trailers = collected.trailers().cloned();
    Ok((collected.to_bytes(), trailers))
}

/// Build a request record from a received request head and its body
#[must_use]
pub fn request_info(
    parts: &request::Parts,
    body: Bytes,
    trailers: Option<&HeaderMap>,
) -> RequestInfo {
    RequestInfo {
        id: Uuid::new_v4(),
        method: parts.method.as_str().to_string(),
        url: parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
        http_version: version_label(parts.version).to_string(),
        headers: Headers::from_header_map(&parts.headers),
        body: Some(body),
        trailers: trailers.map(Headers::from_header_map),
    }
}

/// Build a response record from a received response head
///
/// An empty body is recorded as absent.
#[must_use]
pub fn response_info(
    parts: &response::Parts,
    request_id: RequestId,
    body: Bytes,
    trailers: Option<&HeaderMap>,
) -> ResponseInfo {
    let status_message = parts
        .extensions
        .get::<ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
        .or_else(|| parts.status.canonical_reason().map(str::to_string))
        .unwrap_or_default();

    ResponseInfo {
        request_id,
        http_version: version_label(parts.version).to_string(),
        status_code: parts.status.as_u16(),
        status_message,
        headers: Headers::from_header_map(&parts.headers),
        body: (!body.is_empty()).then_some(body),
        trailers: trailers.map(Headers::from_header_map),
    }
}
