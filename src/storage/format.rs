//! Cassette text format
//!
//! One file per interaction:
//!
//! ```text
//! <METHOD> <url> HTTP/<version>
//! <name>: <value>
//!
//! "<json body>"
//!
//! -----
//!
//! HTTP/<version> <status> <reason>
//! <name>: <value>
//!
//! "<json body>"
//! ```
//!
//! File names are `<ms>_<direction>_<url>_<METHOD>`, with `/` in the url
//! written as `_`.

use bytes::Bytes;
use uuid::Uuid;

use crate::interaction::{Direction, HeaderValue, Headers, Interaction, RequestInfo, ResponseInfo};
use crate::{Result, StenoError};

/// Line separating the request block from the response block
pub const SEPARATOR: &str = "-----";

const DEFAULT_HTTP_VERSION: &str = "1.1";

/// File name prefix for an interaction captured at `timestamp`
#[must_use]
pub fn recording_label(timestamp: u64, direction: Direction) -> String {
    format!("{timestamp}_{direction}")
}

/// File name for a request, before collision suffixes
#[must_use]
pub fn file_stem(label: &str, request: &RequestInfo) -> String {
    let url = request.url.strip_prefix('/').unwrap_or(&request.url);
    let path = url.replace('/', "_");
    if label.is_empty() {
        format!("{path}_{}", request.method)
    } else {
        format!("{label}_{path}_{}", request.method)
    }
}

/// Recover the capture timestamp and direction from a file name
///
/// # Errors
///
/// Returns error if the name does not start with `<ms>_<direction>_`
pub fn parse_file_name(name: &str) -> Result<(u64, Direction)> {
    let mut segments = name.split('_');
    let timestamp = segments
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| StenoError::InvalidFormat(format!("No timestamp in file name '{name}'")))?;
    let direction = segments
        .next()
        .ok_or_else(|| StenoError::InvalidFormat(format!("No direction in file name '{name}'")))?
        .parse::<Direction>()?;
    Ok((timestamp, direction))
}

fn encode_headers(out: &mut String, headers: &Headers) {
    for (name, value) in headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&value.to_wire());
        out.push('\n');
    }
}

/// Request block, up to and including the separator
///
/// # Errors
///
/// Returns error if the body cannot be JSON encoded
pub fn encode_request(request: &RequestInfo) -> Result<String> {
    let mut out = format!(
        "{} {} HTTP/{}\n",
        request.method, request.url, request.http_version
    );
    encode_headers(&mut out, &request.headers);
    out.push('\n');
    if request.body.is_some() {
        out.push_str(&serde_json::to_string(&request.body_text())?);
        out.push_str("\n\n");
    }
    out.push_str(SEPARATOR);
    out.push_str("\n\n");
    Ok(out)
}

/// Response block, with the body decoded per `content-encoding`
///
/// # Errors
///
/// Returns error if the body cannot be JSON encoded
pub fn encode_response(response: &ResponseInfo) -> Result<String> {
    let mut out = format!(
        "HTTP/{} {} {}\n",
        response.http_version, response.status_code, response.status_message
    );
    encode_headers(&mut out, &response.headers);
    out.push('\n');

    if let Some(text) = response.display_body() {
        out.push_str(&serde_json::to_string(&text)?);
    }
    out.push('\n');
    Ok(out)
}

/// Parse a whole cassette file
///
/// # Errors
///
/// Returns [`StenoError::InvalidFormat`] if either block is missing or malformed
pub fn parse_interaction(
    contents: &str,
    timestamp: u64,
    direction: Direction,
) -> Result<Interaction> {
    let separator = format!("\n{SEPARATOR}\n");
    let (request_data, response_data) = contents
        .split_once(&separator)
        .ok_or_else(|| StenoError::InvalidFormat("Missing request/response separator".into()))?;

    let request = parse_request(request_data)?;
    let response = parse_response(response_data.trim_start_matches('\n'), request.id)?;

    Ok(Interaction {
        request,
        response,
        direction,
        timestamp,
        request_timestamp: None,
        response_timestamp: None,
    })
}

/// Header lines up to the first blank line, and the body line after it
fn parse_block<'a>(lines: &[&'a str]) -> Result<(Headers, Option<&'a str>)> {
    let blank = lines
        .iter()
        .position(|line| line.is_empty())
        .ok_or_else(|| StenoError::InvalidFormat("Cannot find end of headers".into()))?;

    let mut headers = Headers::new();
    for line in &lines[..blank] {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StenoError::InvalidFormat(format!("Invalid header line '{line}'")))?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        headers.insert(name, HeaderValue::parse_wire(value));
    }

    let body = lines.get(blank + 1).copied().filter(|line| !line.is_empty());
    Ok((headers, body))
}

fn parse_body(line: Option<&str>) -> Result<Option<Bytes>> {
    line.map(|json| {
        let text: String = serde_json::from_str(json)?;
        Ok(Bytes::from(text))
    })
    .transpose()
}

fn parse_request(data: &str) -> Result<RequestInfo> {
    let lines: Vec<&str> = data.split('\n').collect();
    let (first, rest) = lines
        .split_first()
        .ok_or_else(|| StenoError::InvalidFormat("Empty request block".into()))?;

    let mut parts = first.split(' ');
    let (Some(method), Some(url)) = (parts.next(), parts.next()) else {
        return Err(StenoError::InvalidFormat(format!(
            "Invalid request line '{first}'"
        )));
    };
    if method.is_empty() || url.is_empty() {
        return Err(StenoError::InvalidFormat(format!(
            "Invalid request line '{first}'"
        )));
    }
    let http_version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_HTTP_VERSION);

    let (headers, body) = parse_block(rest)?;

    Ok(RequestInfo {
        id: Uuid::new_v4(),
        method: method.to_string(),
        url: url.to_string(),
        http_version: http_version.to_string(),
        headers,
        body: parse_body(body)?,
        trailers: None,
    })
}

fn parse_response(data: &str, request_id: Uuid) -> Result<ResponseInfo> {
    let lines: Vec<&str> = data.split('\n').collect();
    let (first, rest) = lines
        .split_first()
        .ok_or_else(|| StenoError::InvalidFormat("Empty response block".into()))?;

    let invalid = || StenoError::InvalidFormat(format!("Invalid status line '{first}'"));
    let status_line = first.strip_prefix("HTTP/").ok_or_else(invalid)?;
    let mut parts = status_line.splitn(3, ' ');
    let http_version = parts.next().filter(|v| !v.is_empty()).ok_or_else(invalid)?;
    let status_code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(invalid)?;
    let status_message = parts.next().unwrap_or_default();

    let (mut headers, body) = parse_block(rest)?;

    // The stored body is already decoded
    if headers.remove("content-encoding").is_some() {
        headers.remove("content-length");
    }

    Ok(ResponseInfo {
        request_id,
        http_version: http_version.to_string(),
        status_code,
        status_message: status_message.to_string(),
        headers,
        body: parse_body(body)?,
        trailers: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING: &str = "GET /ping HTTP/1.1\n\
        host: localhost:3000\n\
        accept: text/plain, text/html\n\
        \n\
        \"\"\n\
        \n\
        -----\n\
        \n\
        HTTP/1.1 200 OK\n\
        content-type: text/plain\n\
        \n\
        \"pong\"\n";

    fn request(url: &str, method: &str) -> RequestInfo {
        RequestInfo {
            id: Uuid::new_v4(),
            method: method.to_string(),
            url: url.to_string(),
            http_version: "1.1".to_string(),
            headers: Headers::new(),
            body: None,
            trailers: None,
        }
    }

    #[test]
    fn test_file_stem() {
        let label = recording_label(1_700_000_000_000, Direction::Outgoing);
        assert_eq!(
            file_stem(&label, &request("/api/chat.postMessage", "POST")),
            "1700000000000_outgoing_api_chat.postMessage_POST"
        );
        assert_eq!(file_stem("", &request("/a/b", "GET")), "a_b_GET");
        assert_eq!(file_stem("1_incoming", &request("/", "GET")), "1_incoming__GET");
    }

    #[test]
    fn test_parse_file_name() {
        let (timestamp, direction) = parse_file_name("1700000000000_incoming_hook_POST_2").unwrap();
        assert_eq!(timestamp, 1_700_000_000_000);
        assert_eq!(direction, Direction::Incoming);

        assert!(parse_file_name("README").is_err());
        assert!(parse_file_name("12_sideways_x_GET").is_err());
    }

    #[test]
    fn test_parse_interaction() {
        let interaction = parse_interaction(PING, 100, Direction::Outgoing).unwrap();
        let request = &interaction.request;
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/ping");
        assert_eq!(request.http_version, "1.1");
        assert_eq!(
            request.headers.get("accept"),
            Some(&HeaderValue::Multi(vec!["text/plain".into(), "text/html".into()]))
        );
        assert_eq!(request.body.as_deref(), Some(&b""[..]));

        let response = &interaction.response;
        assert_eq!(response.request_id, request.id);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status_message, "OK");
        assert_eq!(response.body.as_deref(), Some(&b"pong"[..]));
        assert_eq!(interaction.timestamp, 100);
    }

    #[test]
    fn test_encode_then_parse() {
        let mut original = request("/api/users?id=1", "POST");
        original.headers = [("content-type", "application/json"), ("x-list", "a"), ("x-list", "b")]
            .into_iter()
            .collect();
        original.body = Some(Bytes::from("{\"name\":\"line\\nbreak\"}"));

        let response = ResponseInfo {
            request_id: original.id,
            http_version: "1.1".to_string(),
            status_code: 404,
            status_message: "Not Found".to_string(),
            headers: [("content-type", "application/json")].into_iter().collect(),
            body: Some(Bytes::from("{\"ok\":false}")),
            trailers: None,
        };

        let contents = encode_request(&original).unwrap() + &encode_response(&response).unwrap();
        let parsed = parse_interaction(&contents, 5, Direction::Outgoing).unwrap();

        assert_eq!(parsed.request.method, original.method);
        assert_eq!(parsed.request.url, original.url);
        assert_eq!(parsed.request.headers, original.headers);
        assert_eq!(parsed.request.body, original.body);
        assert_eq!(parsed.response.status_code, 404);
        assert_eq!(parsed.response.status_message, "Not Found");
        assert_eq!(parsed.response.headers, response.headers);
        assert_eq!(parsed.response.body, response.body);
    }

    #[test]
    fn test_bodyless_blocks() {
        let mut original = request("/empty", "DELETE");
        original.headers = [("x-a", "1")].into_iter().collect();
        let response = ResponseInfo {
            request_id: original.id,
            http_version: "1.1".to_string(),
            status_code: 204,
            status_message: "No Content".to_string(),
            headers: Headers::new(),
            body: None,
            trailers: None,
        };

        let contents = encode_request(&original).unwrap() + &encode_response(&response).unwrap();
        let parsed = parse_interaction(&contents, 1, Direction::Incoming).unwrap();
        assert_eq!(parsed.request.body, None);
        assert_eq!(parsed.response.body, None);
        assert_eq!(parsed.response.status_code, 204);
    }

    #[test]
    fn test_content_encoding_removed_on_load() {
        let contents = "GET / HTTP/1.1\n\n-----\n\n\
            HTTP/1.1 200 OK\n\
            content-encoding: gzip\n\
            content-length: 31\n\
            x-kept: yes\n\
            \n\
            \"decoded\"\n";
        let parsed = parse_interaction(contents, 1, Direction::Outgoing).unwrap();
        assert!(parsed.response.headers.get("content-encoding").is_none());
        assert!(parsed.response.headers.get("content-length").is_none());
        assert!(parsed.response.headers.get("x-kept").is_some());
    }

    #[test]
    fn test_malformed() {
        assert!(parse_interaction("GET / HTTP/1.1\n\n", 1, Direction::Outgoing).is_err());
        assert!(parse_interaction(
            "GET / HTTP/1.1\n\n-----\n\nnot a status line\n\n",
            1,
            Direction::Outgoing
        )
        .is_err());
        assert!(parse_interaction(
            "GET / HTTP/1.1\nno-colon\n\n-----\n\nHTTP/1.1 200 OK\n\n",
            1,
            Direction::Outgoing
        )
        .is_err());
    }
}
