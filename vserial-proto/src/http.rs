//! HTTP/1.1 subset codec.
//!
//! Only what the RPC needs: `GET` and `POST`, `HTTP/1.1`, bodies framed by
//! an exact `Content-Length`. Chunked transfer encoding is rejected
//! outright. One serialized message is emitted with a single write so a
//! message never crosses the channel partially interleaved.

use std::collections::HashMap;
use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::channel::Channel;
use crate::error::{ProtocolError, WireError};

/// Upper bound for the start line + header block, terminator included.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Default per-route body cap.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Canonical header names used on the wire.
pub mod header {
    pub const REQUEST_ID: &str = "X-Request-ID";
    pub const TIMESTAMP: &str = "X-Timestamp";
    pub const RESPONSE_TIME: &str = "X-Response-Time";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";

    pub const JSON_UTF8: &str = "application/json; charset=utf-8";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list. Lookup is case-insensitive; names are written out
/// exactly as stored, so setters use the canonical constants.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing value for `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (n, v) in self.0.iter_mut() {
            if n.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.0.push((name.to_string(), value));
    }

    /// Append without replacing; parsing uses this so duplicates stay
    /// visible to the framing checks.
    fn append(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn count(&self, name: &str) -> usize {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw path including any query string.
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Path with the query string stripped, for route lookup.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Query string parsed into a string map. Later duplicates win.
    pub fn query(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Some((_, qs)) = self.path.split_once('?') {
            for pair in qs.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => out.insert(k.to_string(), v.to_string()),
                    None => out.insert(pair.to_string(), String::new()),
                };
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

/// Advisory reason phrase; clients key off the numeric code.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serialize a request: start line, headers, blank line, body.
/// `Content-Length` is always emitted, body or not.
pub fn serialize_request(req: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + req.body.len());
    out.extend_from_slice(req.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(req.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    serialize_tail(&mut out, &req.headers, &req.body);
    out
}

pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + resp.body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(resp.status.to_string().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(resp.reason.as_bytes());
    out.extend_from_slice(b"\r\n");
    serialize_tail(&mut out, &resp.headers, &resp.body);
    out
}

fn serialize_tail(out: &mut Vec<u8>, headers: &Headers, body: &[u8]) {
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case(header::CONTENT_LENGTH) {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(header::CONTENT_LENGTH.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(body);
}

/// Write one request as a single channel write.
pub async fn write_request<S: AsyncRead + AsyncWrite + Unpin>(
    ch: &mut Channel<S>,
    req: &Request,
    deadline: Option<Instant>,
) -> Result<(), WireError> {
    ch.write_all(&serialize_request(req), deadline).await?;
    Ok(())
}

/// Write one response as a single channel write.
pub async fn write_response<S: AsyncRead + AsyncWrite + Unpin>(
    ch: &mut Channel<S>,
    resp: &Response,
    deadline: Option<Instant>,
) -> Result<(), WireError> {
    ch.write_all(&serialize_response(resp), deadline).await?;
    Ok(())
}

/// Read one request off the channel.
///
/// The header block must terminate within `MAX_HEADER_BYTES`; the body must
/// fit `max_body` (checked against `Content-Length` before any body
/// allocation).
pub async fn read_request<S: AsyncRead + AsyncWrite + Unpin>(
    ch: &mut Channel<S>,
    max_body: usize,
    deadline: Option<Instant>,
) -> Result<Request, WireError> {
    let head = ch
        .read_until(b"\r\n\r\n", MAX_HEADER_BYTES, "header block", deadline)
        .await?;
    let head = std::str::from_utf8(&head)
        .map_err(|_| ProtocolError::Malformed("header block is not valid UTF-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| ProtocolError::Malformed("empty message".to_string()))?;

    let mut parts = start.split(' ');
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) => (m, p, v),
        _ => {
            return Err(
                ProtocolError::Malformed(format!("bad request line: {start:?}")).into(),
            );
        }
    };
    let method = Method::parse(method)
        .ok_or_else(|| ProtocolError::Malformed(format!("unsupported method: {method}")))?;
    if version != "HTTP/1.1" {
        return Err(ProtocolError::Malformed(format!("unsupported version: {version}")).into());
    }
    if !path.starts_with('/') {
        return Err(ProtocolError::Malformed(format!("bad path: {path:?}")).into());
    }

    let headers = parse_header_lines(lines)?;
    let body_len = framed_body_len(&headers)?;
    if body_len > max_body {
        return Err(ProtocolError::Oversize {
            what: "body",
            limit: max_body,
        }
        .into());
    }
    let body = ch.read_exact_bytes(body_len, deadline).await?;

    Ok(Request {
        method,
        path: path.to_string(),
        headers,
        body,
    })
}

/// Read one response off the channel.
pub async fn read_response<S: AsyncRead + AsyncWrite + Unpin>(
    ch: &mut Channel<S>,
    max_body: usize,
    deadline: Option<Instant>,
) -> Result<Response, WireError> {
    let head = ch
        .read_until(b"\r\n\r\n", MAX_HEADER_BYTES, "header block", deadline)
        .await?;
    let head = std::str::from_utf8(&head)
        .map_err(|_| ProtocolError::Malformed("header block is not valid UTF-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| ProtocolError::Malformed("empty message".to_string()))?;

    let rest = start
        .strip_prefix("HTTP/1.1 ")
        .ok_or_else(|| ProtocolError::Malformed(format!("bad status line: {start:?}")))?;
    let (status, reason) = match rest.split_once(' ') {
        Some((s, r)) => (s, r),
        None => (rest, ""),
    };
    let status: u16 = status
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("bad status code: {status:?}")))?;

    let headers = parse_header_lines(lines)?;
    let body_len = framed_body_len(&headers)?;
    if body_len > max_body {
        return Err(ProtocolError::Oversize {
            what: "body",
            limit: max_body,
        }
        .into());
    }
    let body = ch.read_exact_bytes(body_len, deadline).await?;

    Ok(Response {
        status,
        reason: reason.to_string(),
        headers,
        body,
    })
}

/// Parse `Name: Value` lines up to the blank terminator.
fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Headers, ProtocolError> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Malformed(format!("bad header line: {line:?}")))?;
        if name.is_empty() || name.contains(' ') {
            return Err(ProtocolError::Malformed(format!("bad header name: {name:?}")));
        }
        headers.append(name.to_string(), value.trim().to_string());
    }
    Ok(headers)
}

/// Resolve the body length from the framing headers.
///
/// Chunked transfer is rejected entirely; `Content-Length` must be unique
/// and numeric; absence means an empty body.
fn framed_body_len(headers: &Headers) -> Result<usize, ProtocolError> {
    if headers.count(header::TRANSFER_ENCODING) > 0 {
        return Err(ProtocolError::Malformed(
            "transfer encoding is not supported".to_string(),
        ));
    }
    match headers.count(header::CONTENT_LENGTH) {
        0 => Ok(0),
        1 => {
            let raw = headers.get(header::CONTENT_LENGTH).unwrap_or("");
            raw.parse::<usize>()
                .map_err(|_| ProtocolError::Malformed(format!("bad content length: {raw:?}")))
        }
        _ => Err(ProtocolError::Malformed(
            "duplicate content length".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paired() -> (Channel<tokio::io::DuplexStream>, Channel<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (Channel::new(a), Channel::new(b))
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (mut client, mut server) = paired().await;

        let mut req = Request::new(Method::Post, "/api/v1/shell/exec?verbose=1");
        req.headers.set(header::REQUEST_ID, "r-42");
        req.headers.set(header::CONTENT_TYPE, header::JSON_UTF8);
        req.body = br#"{"params":{"command":"ls /tmp"}}"#.to_vec();

        write_request(&mut client, &req, None).await.unwrap();
        let got = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap();

        assert_eq!(got.method, Method::Post);
        assert_eq!(got.path, "/api/v1/shell/exec?verbose=1");
        assert_eq!(got.route_path(), "/api/v1/shell/exec");
        assert_eq!(got.query().get("verbose").map(String::as_str), Some("1"));
        assert_eq!(got.headers.get("x-request-id"), Some("r-42"));
        assert_eq!(got.body, req.body);
    }

    #[tokio::test]
    async fn response_roundtrip() {
        let (mut client, mut server) = paired().await;

        let mut resp = Response::new(200);
        resp.headers.set(header::REQUEST_ID, "r-42");
        resp.headers.set(header::RESPONSE_TIME, "17");
        resp.body = br#"{"code":0}"#.to_vec();

        write_response(&mut server, &resp, None).await.unwrap();
        let got = read_response(&mut client, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap();

        assert_eq!(got.status, 200);
        assert_eq!(got.reason, "OK");
        assert_eq!(got.headers.get(header::RESPONSE_TIME), Some("17"));
        assert_eq!(got.body, resp.body);
    }

    #[tokio::test]
    async fn empty_body_when_content_length_absent() {
        let (mut client, mut server) = paired().await;
        client
            .write_all(b"GET /api/v1/ping HTTP/1.1\r\nX-Request-ID: r1\r\n\r\n", None)
            .await
            .unwrap();
        let got = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap();
        assert!(got.body.is_empty());
    }

    #[tokio::test]
    async fn duplicate_content_length_rejected() {
        let (mut client, mut server) = paired().await;
        client
            .write_all(
                b"POST /x HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nhi",
                None,
            )
            .await
            .unwrap();
        let err = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn transfer_encoding_rejected() {
        let (mut client, mut server) = paired().await;
        client
            .write_all(
                b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                None,
            )
            .await
            .unwrap();
        let err = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn body_over_limit_rejected_before_read() {
        let (mut client, mut server) = paired().await;
        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 1000\r\n\r\n", None)
            .await
            .unwrap();
        // only the head is sent; the limit check must fire without the body
        let err = read_request(&mut server, 999, None).await.unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Oversize { what: "body", .. })
        ));
    }

    #[tokio::test]
    async fn body_at_limit_accepted() {
        let (mut client, mut server) = paired().await;
        let body = vec![b'x'; 64];
        let mut req = Request::new(Method::Post, "/x");
        req.body = body.clone();
        write_request(&mut client, &req, None).await.unwrap();
        let got = read_request(&mut server, 64, None).await.unwrap();
        assert_eq!(got.body, body);
    }

    #[tokio::test]
    async fn header_block_at_limit_accepted() {
        let (mut client, mut server) = paired().await;

        // pad a header value so the block is exactly MAX_HEADER_BYTES
        let skeleton = "GET /p HTTP/1.1\r\nX-Pad: \r\n\r\n".len();
        let pad = "p".repeat(MAX_HEADER_BYTES - skeleton);
        let msg = format!("GET /p HTTP/1.1\r\nX-Pad: {pad}\r\n\r\n");
        assert_eq!(msg.len(), MAX_HEADER_BYTES);

        client.write_all(msg.as_bytes(), None).await.unwrap();
        let got = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap();
        assert_eq!(got.path, "/p");
    }

    #[tokio::test]
    async fn header_block_over_limit_rejected() {
        let (mut client, mut server) = paired().await;

        let skeleton = "GET /p HTTP/1.1\r\nX-Pad: \r\n\r\n".len();
        let pad = "p".repeat(MAX_HEADER_BYTES - skeleton + 1);
        let msg = format!("GET /p HTTP/1.1\r\nX-Pad: {pad}\r\n\r\n");
        assert_eq!(msg.len(), MAX_HEADER_BYTES + 1);

        client.write_all(msg.as_bytes(), None).await.unwrap();
        let err = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Oversize { what: "header block", .. })
        ));
    }

    #[tokio::test]
    async fn unknown_method_rejected() {
        let (mut client, mut server) = paired().await;
        client
            .write_all(b"PUT /x HTTP/1.1\r\n\r\n", None)
            .await
            .unwrap();
        let err = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn http10_rejected() {
        let (mut client, mut server) = paired().await;
        client
            .write_all(b"GET /x HTTP/1.0\r\n\r\n", None)
            .await
            .unwrap();
        let err = read_request(&mut server, DEFAULT_MAX_BODY_BYTES, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn back_to_back_requests_parse_cleanly() {
        let (mut client, mut server) = paired().await;

        let mut first = Request::new(Method::Post, "/a");
        first.body = b"one".to_vec();
        let mut second = Request::new(Method::Get, "/b");
        second.headers.set(header::REQUEST_ID, "r2");

        let mut bytes = serialize_request(&first);
        bytes.extend_from_slice(&serialize_request(&second));
        client.write_all(&bytes, None).await.unwrap();

        let got1 = read_request(&mut server, 1024, None).await.unwrap();
        let got2 = read_request(&mut server, 1024, None).await.unwrap();
        assert_eq!(got1.path, "/a");
        assert_eq!(got1.body, b"one");
        assert_eq!(got2.path, "/b");
        assert!(got2.body.is_empty());
    }

    #[test]
    fn query_parsing() {
        let req = Request::new(Method::Get, "/api/v1/file/info?path=/tmp/a.txt&flag");
        let q = req.query();
        assert_eq!(q.get("path").map(String::as_str), Some("/tmp/a.txt"));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));

        let req = Request::new(Method::Get, "/api/v1/ping");
        assert!(req.query().is_empty());
    }
}
