//! Parsing of the HTTP header blocks embedded in REQMOD/RESPMOD requests.
//!
//! The blocks are kept byte-exact in the exchange state; these functions only
//! extract what services commonly need (method, URL pieces, host, status and
//! Content-Length) and fill the lowercase header table.

use super::split_header;
use crate::error::{Error, IcapResult};
use crate::exchange::HeaderTable;

/// Status assumed when the embedded response line cannot be read.
pub const FALLBACK_HTTP_STATUS: u16 = 502;

/// Values extracted from an embedded HTTP request head.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub first_line: String,
    pub method: String,
    /// Absolute URL, rebuilt from `Host` when the request line carries a path.
    pub url: String,
    /// `url` without the query part.
    pub path: String,
    pub query: Option<String>,
    /// Host without port.
    pub host: Option<String>,
    pub content_length: Option<u64>,
}

/// Values extracted from an embedded HTTP response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub first_line: String,
    pub status: u16,
    pub content_length: Option<u64>,
}

fn header_lines(block: &[u8]) -> impl Iterator<Item = &str> {
    // Header blocks are ASCII in practice; a non UTF-8 line is skipped
    // rather than failing the exchange.
    block
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .take_while(|line| !line.is_empty())
        .filter_map(|line| std::str::from_utf8(line).ok())
}

fn parse_content_length(value: &str) -> IcapResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::header(format!("invalid Content-Length: {value}")))
}

/// `www.example.com:8080` -> `www.example.com`, `[::1]:80` -> `[::1]`.
pub fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.split_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}

fn is_absolute(url: &str) -> bool {
    ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| {
            url.get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        })
}

/// Extracts the host part of an absolute URL (`http://h:1/p` -> `h`).
pub fn host_of_url(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let authority = rest.split(['/', '?']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let host = strip_port(authority);
    (!host.is_empty()).then_some(host)
}

/// Parses the request line and headers of an embedded HTTP request.
pub fn parse_request_head(block: &[u8], headers: &mut HeaderTable) -> IcapResult<RequestHead> {
    let mut head = RequestHead::default();
    let mut lines = header_lines(block);

    let Some(first) = lines.next() else {
        return Ok(head);
    };
    head.first_line = first.to_string();
    let mut parts = first.split_whitespace();
    head.method = parts.next().unwrap_or_default().to_ascii_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| Error::parse(format!("HTTP request line without target: {first}")))?;
    match target.split_once('?') {
        Some((path, query)) => {
            head.path = path.to_string();
            head.query = Some(query.to_string());
        }
        None => head.path = target.to_string(),
    }
    head.url = target.to_string();

    for line in lines {
        let Some((name, value)) = split_header(line) else {
            continue;
        };
        if name.eq_ignore_ascii_case("host") {
            head.host = Some(strip_port(value).to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            let len = parse_content_length(value)?;
            head.content_length = Some(len);
            headers.insert(name, len.to_string());
            continue;
        }
        headers.insert(name, value);
    }

    if !is_absolute(&head.url) {
        if let Some(host) = head.host.as_deref() {
            if head.url.starts_with('/') {
                head.url = format!("http://{host}{}", head.url);
                head.path = format!("http://{host}{}", head.path);
            } else {
                head.url = format!("http://{host}/{}", head.url);
                head.path = format!("http://{host}/{}", head.path);
            }
        }
    } else if head.host.is_none() {
        head.host = host_of_url(&head.url).map(str::to_string);
    }

    Ok(head)
}

/// Parses the status line and headers of an embedded HTTP response.
pub fn parse_response_head(block: &[u8], headers: &mut HeaderTable) -> IcapResult<ResponseHead> {
    let mut lines = header_lines(block);
    let first = lines.next().unwrap_or_default();
    let status = first
        .split_whitespace()
        .nth(1)
        .and_then(|code| http::StatusCode::from_bytes(code.as_bytes()).ok())
        .map_or(FALLBACK_HTTP_STATUS, |code| code.as_u16());

    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = split_header(line) else {
            continue;
        };
        if name.eq_ignore_ascii_case("content-length") {
            let len = parse_content_length(value)?;
            content_length = Some(len);
            headers.insert(name, len.to_string());
            continue;
        }
        headers.insert(name, value);
    }

    Ok(ResponseHead {
        first_line: first.to_string(),
        status,
        content_length,
    })
}
