//! HTTP/1.1 request parser and response generator.
//!
//! Parses request heads (request line + header fields) out of a connection
//! buffer and decides how the body that follows is framed. Responses are
//! always framed with `Content-Length`.

use bytes::{Bytes, BytesMut};
use std::str;
use std::time::Duration;

/// Value of the `Server` response header
pub const SERVER_NAME: &str = "keepalive-echo";

/// Maximum number of header fields accepted in one request
pub const MAX_HEADERS: usize = 100;

/// Interim response sent to clients waiting on `Expect: 100-continue`
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Request method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Other(token) => token,
        }
    }
}

/// Protocol version from the request line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Header fields in arrival order, looked up case-insensitively.
///
/// Values are kept as the raw bytes received, so non-UTF-8 values survive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    fn push(&mut self, name: String, value: Bytes) {
        self.entries.push((name, value));
    }

    /// First value of the named field
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| &v[..])
    }

    /// First value of the named field, if it is valid UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| str::from_utf8(v).ok())
    }

    /// Every value of the named field
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| &v[..])
    }

    /// Whether a comma-separated field contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .filter_map(|value| str::from_utf8(value).ok())
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How the request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    Empty,
    /// Exactly this many bytes follow
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
}

/// Parsed request line and header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    pub fn user_agent(&self) -> Option<&[u8]> {
        self.headers.get("user-agent")
    }

    /// Whether the client allows the connection to stay open after the response.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    pub fn expects_continue(&self) -> bool {
        self.version == Version::Http11
            && self
                .headers
                .get_str("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    pub fn is_gzip(&self) -> bool {
        self.headers.has_token("content-encoding", "gzip")
    }

    /// Decide how the body is framed. Transfer-Encoding wins over Content-Length.
    pub fn body_framing(&self) -> Result<BodyFraming, ParseError> {
        let mut codings: Vec<&str> = Vec::new();
        for value in self.headers.get_all("transfer-encoding") {
            let value = str::from_utf8(value).map_err(|_| {
                ParseError::UnsupportedTransferEncoding(String::from_utf8_lossy(value).into_owned())
            })?;
            codings.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|coding| !coding.is_empty()),
            );
        }

        if let Some(last) = codings.last() {
            if self.version == Version::Http10 {
                return Err(ParseError::UnsupportedTransferEncoding(format!(
                    "{} in HTTP/1.0 request",
                    last
                )));
            }
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Err(ParseError::UnsupportedTransferEncoding(last.to_string()));
        }

        let mut length: Option<u64> = None;
        for value in self.headers.get_all("content-length") {
            let value = str::from_utf8(value).map_err(|_| {
                ParseError::InvalidContentLength(String::from_utf8_lossy(value).into_owned())
            })?;
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidContentLength(value.to_string()));
                }
                let n: u64 = part
                    .parse()
                    .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
                match length {
                    Some(prev) if prev != n => {
                        return Err(ParseError::InvalidContentLength(value.to_string()))
                    }
                    _ => length = Some(n),
                }
            }
        }

        Ok(match length {
            None | Some(0) => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n),
        })
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Need more data to complete parsing
    Incomplete,
    /// Request line is not `METHOD target HTTP/x.y`
    InvalidRequestLine(String),
    /// HTTP version other than 1.0 or 1.1
    UnsupportedVersion(String),
    /// Malformed header field
    InvalidHeader(String),
    /// Request head exceeds the configured size
    HeadersTooLarge,
    /// More than `MAX_HEADERS` fields
    TooManyHeaders,
    /// Content-Length is not a number or conflicts with another
    InvalidContentLength(String),
    /// Transfer coding other than chunked
    UnsupportedTransferEncoding(String),
    /// Malformed chunked body
    InvalidChunk(String),
}

impl ParseError {
    /// Status code of the response sent for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::HeadersTooLarge | ParseError::TooManyHeaders => {
                StatusCode::RequestHeaderFieldsTooLarge
            }
            _ => StatusCode::BadRequest,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "Incomplete request"),
            ParseError::InvalidRequestLine(line) => write!(f, "Invalid request line: {}", line),
            ParseError::UnsupportedVersion(v) => write!(f, "Unsupported HTTP version: {}", v),
            ParseError::InvalidHeader(msg) => write!(f, "Invalid header: {}", msg),
            ParseError::HeadersTooLarge => write!(f, "Request headers too large"),
            ParseError::TooManyHeaders => write!(f, "Too many headers"),
            ParseError::InvalidContentLength(v) => write!(f, "Invalid Content-Length: {}", v),
            ParseError::UnsupportedTransferEncoding(v) => {
                write!(f, "Unsupported Transfer-Encoding: {}", v)
            }
            ParseError::InvalidChunk(msg) => write!(f, "Invalid chunk: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing a request head
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed head with bytes consumed
    Complete(RequestHead, usize),
    /// Parse error
    Error(ParseError),
}

/// Parser for HTTP/1.x request heads
pub struct Parser;

impl Parser {
    /// Parse a request head from the buffer.
    ///
    /// Empty lines before the request line are skipped and counted as consumed.
    /// They also count towards `max_header_size`.
    pub fn parse(buffer: &[u8], max_header_size: usize) -> ParseResult {
        let mut start = 0;
        while buffer[start..].starts_with(b"\r\n") {
            start += 2;
        }
        let rest = &buffer[start..];

        let head_len = match find_head_end(rest) {
            Some(pos) if start + pos > max_header_size => {
                return ParseResult::Error(ParseError::HeadersTooLarge)
            }
            Some(pos) => pos,
            None if buffer.len() > max_header_size => {
                return ParseResult::Error(ParseError::HeadersTooLarge)
            }
            None => return ParseResult::Error(ParseError::Incomplete),
        };

        let mut lines = split_lines(&rest[..head_len]);
        let request_line = lines.next().unwrap_or_default();

        let (method, target, version) = match parse_request_line(request_line) {
            Ok(parts) => parts,
            Err(e) => return ParseResult::Error(e),
        };

        let mut headers = Headers::default();
        for line in lines {
            if headers.len() == MAX_HEADERS {
                return ParseResult::Error(ParseError::TooManyHeaders);
            }
            match parse_header_line(line) {
                Ok((name, value)) => headers.push(name, value),
                Err(e) => return ParseResult::Error(e),
            }
        }

        let head = RequestHead {
            method,
            target,
            version,
            headers,
        };
        ParseResult::Complete(head, start + head_len + 4) // Include \r\n\r\n
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let line = str::from_utf8(line)
        .map_err(|_| ParseError::InvalidRequestLine("Invalid UTF-8 in request line".to_string()))?;

    let mut parts = line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(ParseError::InvalidRequestLine(line.to_string())),
    };

    if !method.bytes().all(is_token_char) || target.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidRequestLine(line.to_string()));
    }

    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        v if v.starts_with("HTTP/") => return Err(ParseError::UnsupportedVersion(v.to_string())),
        _ => return Err(ParseError::InvalidRequestLine(line.to_string())),
    };

    Ok((Method::from_token(method), target.to_string(), version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, Bytes), ParseError> {
    if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        return Err(ParseError::InvalidHeader(
            "obsolete line folding".to_string(),
        ));
    }

    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| ParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned()))?;

    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::InvalidHeader(
            String::from_utf8_lossy(line).into_owned(),
        ));
    }

    let value = trim_whitespace(&line[colon + 1..]);
    if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(ParseError::InvalidHeader(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }

    Ok((
        String::from_utf8_lossy(name).into_owned(),
        Bytes::copy_from_slice(value),
    ))
}

/// tchar from RFC 9110
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_whitespace(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// Split on \r\n; the head passed in never includes the terminating blank line.
fn split_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut remaining = Some(head);
    std::iter::from_fn(move || {
        let current = remaining?;
        match find_crlf(current) {
            Some(pos) => {
                remaining = Some(&current[pos + 2..]);
                Some(&current[..pos])
            }
            None => {
                remaining = None;
                Some(current)
            }
        }
    })
}

/// Position of the blank line ending the head
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Find \r\n in buffer
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    RequestTimeout,
    PayloadTooLarge,
    RequestHeaderFieldsTooLarge,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::RequestHeaderFieldsTooLarge => 431,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
        }
    }
}

/// What the response tells the client about the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Connection stays open for this long while idle
    KeepAlive(Duration),
    /// Connection closes after the response
    Close,
}

/// Response generator for HTTP/1.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Response {
    /// 200 OK with the given body
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Response {
            status: StatusCode::Ok,
            body: body.into(),
        }
    }

    /// Error response with a plain-text message body
    pub fn error(status: StatusCode, message: &str) -> Self {
        Response {
            status,
            body: Bytes::from(message.to_string()),
        }
    }

    /// Serialize status line, headers and (unless `head_only`) the body.
    pub fn encode(&self, persistence: Persistence, head_only: bool) -> BytesMut {
        let mut response = BytesMut::with_capacity(128 + self.body.len());
        response.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.code(),
                self.status.reason()
            )
            .as_bytes(),
        );
        response.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        response.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        match persistence {
            Persistence::KeepAlive(timeout) => {
                // whole seconds, rounded up so sub-second timeouts never read as 0
                let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
                response.extend_from_slice(b"Connection: keep-alive\r\n");
                response.extend_from_slice(format!("Keep-Alive: timeout={}\r\n", secs).as_bytes());
            }
            Persistence::Close => response.extend_from_slice(b"Connection: close\r\n"),
        }
        response.extend_from_slice(b"\r\n");
        if !head_only {
            response.extend_from_slice(&self.body);
        }
        response
    }
}
