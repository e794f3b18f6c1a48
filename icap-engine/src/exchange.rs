//! Per-exchange state.
//!
//! One [`ExchangeState`] lives inside each session and is [`reset`] between
//! exchanges: strings, vectors and maps are cleared, never reallocated, so a
//! long-lived pooled worker keeps its buffers warm.
//!
//! [`reset`]: ExchangeState::reset

use crate::parser::icap::Encapsulated;
use crate::parser::http_embed::FALLBACK_HTTP_STATUS;
use std::collections::HashMap;
use std::collections::hash_map::Iter;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Classification of an incoming ICAP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// The peer closed the connection before sending a request line.
    Empty,
    /// Protocol error; answered with `400 Bad Request`.
    Invalid,
    Options,
    ReqMod,
    RespMod,
}

impl RequestType {
    pub fn is_modification(self) -> bool {
        matches!(self, RequestType::ReqMod | RequestType::RespMod)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestType::Empty => "EMPTY",
            RequestType::Invalid => "INVALID",
            RequestType::Options => "OPTIONS",
            RequestType::ReqMod => "REQMOD",
            RequestType::RespMod => "RESPMOD",
        })
    }
}

/// ICAP client vendor, detected from the request URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientBrand {
    /// NetApp filers announce themselves with `brand=netapp`.
    NetApp,
    #[default]
    Other,
}

/// Progress of the parser through the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsePhase {
    #[default]
    AwaitingRequestLine,
    HeaderParsing,
    Options,
    BodyNegotiation,
    PreviewRead,
    FullBodyRead,
    Complete,
}

/// Header map with case-insensitive (lowercased) keys.
#[derive(Debug, Default, Clone)]
pub struct HeaderTable(HashMap<String, String>);

impl HeaderTable {
    fn key(name: &str) -> String {
        name.trim().to_ascii_lowercase()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(Self::key(name), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.0.get(&Self::key(name)).map(String::as_str)
        } else {
            self.0.get(name).map(String::as_str)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&Self::key(name))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Everything learnt about the exchange being processed.
#[derive(Debug)]
pub struct ExchangeState {
    pub(crate) request_type: RequestType,
    pub(crate) brand: ClientBrand,
    pub(crate) phase: ParsePhase,

    /// Raw ICAP request line and headers, CRLF separated.
    pub(crate) icap_head: String,
    pub(crate) service: String,
    pub(crate) icap_headers: HeaderTable,
    pub(crate) encapsulated: Encapsulated,

    pub(crate) req_header: Vec<u8>,
    pub(crate) res_header: Vec<u8>,
    pub(crate) req_headers: HeaderTable,
    pub(crate) res_headers: HeaderTable,
    pub(crate) req_body: Vec<u8>,
    pub(crate) res_body: Vec<u8>,

    pub(crate) first_line: String,
    pub(crate) http_method: String,
    pub(crate) url: String,
    pub(crate) url_path: String,
    pub(crate) query: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) content_length: Option<u64>,
    pub(crate) http_status: u16,

    pub(crate) preview: Option<usize>,
    pub(crate) preview_read: bool,
    pub(crate) preview_starved: bool,
    pub(crate) body_read: bool,
    pub(crate) allow_204: bool,
    pub(crate) allow_206: bool,

    pub(crate) started: Instant,
}

impl Default for ExchangeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeState {
    pub fn new() -> Self {
        Self {
            request_type: RequestType::Empty,
            brand: ClientBrand::Other,
            phase: ParsePhase::AwaitingRequestLine,
            icap_head: String::new(),
            service: String::new(),
            icap_headers: HeaderTable::default(),
            encapsulated: Encapsulated::default(),
            req_header: Vec::new(),
            res_header: Vec::new(),
            req_headers: HeaderTable::default(),
            res_headers: HeaderTable::default(),
            req_body: Vec::new(),
            res_body: Vec::new(),
            first_line: String::new(),
            http_method: String::new(),
            url: String::new(),
            url_path: String::new(),
            query: None,
            host: None,
            content_length: None,
            http_status: FALLBACK_HTTP_STATUS,
            preview: None,
            preview_read: false,
            preview_starved: false,
            body_read: false,
            allow_204: false,
            allow_206: false,
            started: Instant::now(),
        }
    }

    /// Returns the state to its initial values, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.request_type = RequestType::Empty;
        self.brand = ClientBrand::Other;
        self.phase = ParsePhase::AwaitingRequestLine;
        self.icap_head.clear();
        self.service.clear();
        self.icap_headers.clear();
        self.encapsulated = Encapsulated::default();
        self.req_header.clear();
        self.res_header.clear();
        self.req_headers.clear();
        self.res_headers.clear();
        self.req_body.clear();
        self.res_body.clear();
        self.first_line.clear();
        self.http_method.clear();
        self.url.clear();
        self.url_path.clear();
        self.query = None;
        self.host = None;
        self.content_length = None;
        self.http_status = FALLBACK_HTTP_STATUS;
        self.preview = None;
        self.preview_read = false;
        self.preview_starved = false;
        self.body_read = false;
        self.allow_204 = false;
        self.allow_206 = false;
        self.started = Instant::now();
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn brand(&self) -> ClientBrand {
        self.brand
    }

    pub fn phase(&self) -> ParsePhase {
        self.phase
    }

    /// Service path taken from the ICAP URI (`icap://host/<service>`).
    pub fn service(&self) -> &str {
        &self.service
    }

    /// ICAP request line and headers as received.
    pub fn icap_head(&self) -> &str {
        &self.icap_head
    }

    pub fn icap_headers(&self) -> &HeaderTable {
        &self.icap_headers
    }

    pub fn encapsulated(&self) -> &Encapsulated {
        &self.encapsulated
    }

    pub fn request_header(&self) -> &[u8] {
        &self.req_header
    }

    pub fn response_header(&self) -> &[u8] {
        &self.res_header
    }

    pub fn request_headers(&self) -> &HeaderTable {
        &self.req_headers
    }

    pub fn response_headers(&self) -> &HeaderTable {
        &self.res_headers
    }

    pub fn request_body(&self) -> &[u8] {
        &self.req_body
    }

    pub fn response_body(&self) -> &[u8] {
        &self.res_body
    }

    /// Replaces the embedded HTTP request head; the header table is left as is.
    pub fn set_request_header(&mut self, head: impl Into<Vec<u8>>) {
        self.req_header = head.into();
    }

    pub fn set_response_header(&mut self, head: impl Into<Vec<u8>>) {
        self.res_header = head.into();
    }

    pub fn request_body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.req_body
    }

    pub fn response_body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.res_body
    }

    /// Body of the message under adaptation: the request body for REQMOD,
    /// the response body otherwise.
    pub fn body(&self) -> &[u8] {
        match self.request_type {
            RequestType::ReqMod => &self.req_body,
            _ => &self.res_body,
        }
    }

    pub fn body_mut(&mut self) -> &mut Vec<u8> {
        match self.request_type {
            RequestType::ReqMod => &mut self.req_body,
            _ => &mut self.res_body,
        }
    }

    /// HTTP head of the message under adaptation.
    pub fn http_header(&self) -> &[u8] {
        match self.request_type {
            RequestType::ReqMod => &self.req_header,
            _ => &self.res_header,
        }
    }

    /// Header table of the message under adaptation.
    pub fn http_headers(&self) -> &HeaderTable {
        match self.request_type {
            RequestType::ReqMod => &self.req_headers,
            _ => &self.res_headers,
        }
    }

    pub fn first_line(&self) -> &str {
        &self.first_line
    }

    pub fn http_method(&self) -> &str {
        &self.http_method
    }

    /// Absolute URL of the embedded HTTP request.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// [`url`](Self::url) without its query.
    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Status of the embedded HTTP response, 502 when it could not be read.
    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn preview(&self) -> Option<usize> {
        self.preview
    }

    pub fn preview_read(&self) -> bool {
        self.preview_read
    }

    /// The preview carried the whole body (`0; ieof`).
    pub fn preview_starved(&self) -> bool {
        self.preview_starved
    }

    pub fn body_read(&self) -> bool {
        self.body_read
    }

    pub fn allow_204(&self) -> bool {
        self.allow_204
    }

    pub fn allow_206(&self) -> bool {
        self.allow_206
    }

    /// The request announces an encapsulated body.
    pub fn has_body(&self) -> bool {
        self.encapsulated.has_body()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Rewrites (or adds) `Content-Length` in the HTTP head of the message
    /// under adaptation.
    ///
    /// A missing header is only added for a non-zero length on requests; on
    /// responses it is always added.
    pub fn update_content_length(&mut self, length: u64) {
        let (block, table, always_insert) = match self.request_type {
            RequestType::ReqMod => (&mut self.req_header, &mut self.req_headers, false),
            RequestType::RespMod => (&mut self.res_header, &mut self.res_headers, true),
            _ => return,
        };
        let value = length.to_string();
        if table.contains("content-length") {
            replace_header_value(block, "content-length", &value);
        } else if length != 0 || always_insert {
            insert_header_line(block, "Content-Length", &value);
        }
        table.insert("content-length", value);
        self.content_length = Some(length);
    }

    /// Rewrites (or adds) `Content-Type` in the HTTP head of the message
    /// under adaptation.
    pub fn update_content_type(&mut self, content_type: &str) {
        let (block, table) = match self.request_type {
            RequestType::ReqMod => (&mut self.req_header, &mut self.req_headers),
            RequestType::RespMod => (&mut self.res_header, &mut self.res_headers),
            _ => return,
        };
        if table.contains("content-type") {
            replace_header_value(block, "content-type", content_type);
        } else {
            insert_header_line(block, "Content-Type", content_type);
        }
        table.insert("content-type", content_type);
    }

    /// Adds `name: value` to the HTTP head of the message under adaptation,
    /// replacing an existing value.
    pub fn set_http_header(&mut self, name: &str, value: &str) {
        let (block, table) = match self.request_type {
            RequestType::ReqMod => (&mut self.req_header, &mut self.req_headers),
            RequestType::RespMod => (&mut self.res_header, &mut self.res_headers),
            _ => return,
        };
        if table.contains(name) {
            replace_header_value(block, &name.to_ascii_lowercase(), value);
        } else {
            insert_header_line(block, name, value);
        }
        table.insert(name, value);
    }
}

/// Replaces the value of the first `name:` line of an HTTP head.
///
/// `name` must be lowercase. Returns `false` when the header is absent.
pub(crate) fn replace_header_value(block: &mut Vec<u8>, name: &str, value: &str) -> bool {
    let lower = block.to_ascii_lowercase();
    let needle = format!("\r\n{name}:");
    let Some(pos) = memchr::memmem::find(&lower, needle.as_bytes()) else {
        return false;
    };
    let start = pos + needle.len();
    let end = memchr::memmem::find(&lower[start..], b"\r\n").map_or(block.len(), |i| start + i);
    let replacement = format!(" {value}");
    block.splice(start..end, replacement.into_bytes());
    true
}

/// Inserts `Name: value` right before the empty line closing an HTTP head.
pub(crate) fn insert_header_line(block: &mut Vec<u8>, name: &str, value: &str) -> bool {
    if !block.ends_with(b"\r\n\r\n") {
        debug!(header = name, "HTTP head not terminated, header not added");
        return false;
    }
    let at = block.len() - 2;
    let line = format!("{name}: {value}\r\n");
    block.splice(at..at, line.into_bytes());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\n";

    fn reqmod_state() -> ExchangeState {
        let mut state = ExchangeState::new();
        state.request_type = RequestType::ReqMod;
        state.req_header = REQ.to_vec();
        state.req_headers.insert("Host", "example.com");
        state.req_headers.insert("Content-Length", "5");
        state
    }

    #[test]
    fn header_table_is_case_insensitive() {
        let mut table = HeaderTable::default();
        table.insert("X-Authenticated-User", "alice");
        assert_eq!(table.get("x-authenticated-user"), Some("alice"));
        assert_eq!(table.get("X-AUTHENTICATED-USER"), Some("alice"));
        assert!(table.remove("x-Authenticated-user").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn content_length_is_rewritten_in_place() {
        let mut state = reqmod_state();
        state.update_content_length(1234);
        assert_eq!(
            state.request_header(),
            b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 1234\r\n\r\n"
        );
        assert_eq!(state.request_headers().get("content-length"), Some("1234"));
        assert_eq!(state.content_length(), Some(1234));
    }

    #[test]
    fn missing_content_length_is_inserted_for_responses_only_when_needed() {
        let mut state = ExchangeState::new();
        state.request_type = RequestType::ReqMod;
        state.req_header = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        state.update_content_length(0);
        assert_eq!(state.request_header(), b"GET / HTTP/1.1\r\n\r\n");

        state.request_type = RequestType::RespMod;
        state.res_header = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        state.update_content_length(0);
        assert_eq!(
            state.response_header(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn content_type_is_added_then_replaced() {
        let mut state = reqmod_state();
        state.update_content_type("text/plain");
        state.update_content_type("text/html; charset=utf-8");
        let head = String::from_utf8_lossy(state.request_header()).into_owned();
        assert_eq!(head.matches("Content-Type").count(), 1);
        assert!(head.ends_with("Content-Type: text/html; charset=utf-8\r\n\r\n"));
    }

    #[test]
    fn reset_clears_everything_but_capacity() {
        let mut state = reqmod_state();
        state.req_body.extend_from_slice(&[0u8; 4096]);
        state.preview = Some(10);
        state.preview_starved = true;
        state.allow_204 = true;
        state.http_status = 200;
        let capacity = state.req_body.capacity();

        state.reset();

        assert_eq!(state.request_type(), RequestType::Empty);
        assert!(state.request_body().is_empty());
        assert!(state.request_header().is_empty());
        assert!(state.request_headers().is_empty());
        assert_eq!(state.preview(), None);
        assert!(!state.preview_starved());
        assert!(!state.allow_204());
        assert_eq!(state.http_status(), 502);
        assert_eq!(state.req_body.capacity(), capacity);
    }
}
