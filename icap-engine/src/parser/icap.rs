use super::http_embed::{parse_request_head, parse_response_head};
use super::split_header;
use super::wire::{
    CONTINUE_100, read_chunk_data, read_chunk_header, read_exact_into, read_line,
    skip_trailing_crlf,
};
use crate::MAX_HDR_BYTES;
use crate::error::{Error, IcapResult};
use crate::exchange::{ClientBrand, ExchangeState, ParsePhase, RequestType};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// ICAP headers whose values clients send base64 encoded.
const BASE64_HEADERS: [&str; 2] = ["x-authenticated-user", "x-authenticated-groups"];

/// Offsets parsed from the `Encapsulated` header.
///
/// Offsets are **relative to the start of the encapsulated area**
/// (i.e., immediately after the ICAP headers CRLFCRLF).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Encapsulated {
    pub(crate) req_hdr: Option<usize>,
    pub(crate) res_hdr: Option<usize>,
    pub(crate) req_body: Option<usize>,
    pub(crate) res_body: Option<usize>,
    pub(crate) opt_body: Option<usize>,
    pub(crate) null_body: Option<usize>,
}

impl Encapsulated {
    pub fn req_hdr(&self) -> Option<usize> {
        self.req_hdr
    }

    pub fn res_hdr(&self) -> Option<usize> {
        self.res_hdr
    }

    pub fn req_body(&self) -> Option<usize> {
        self.req_body
    }

    pub fn res_body(&self) -> Option<usize> {
        self.res_body
    }

    pub fn null_body(&self) -> Option<usize> {
        self.null_body
    }

    pub fn has_body(&self) -> bool {
        self.req_body.is_some() || self.res_body.is_some()
    }

    fn span(start: Option<usize>, end: Option<usize>, what: &str) -> IcapResult<usize> {
        let Some(start) = start else {
            return Ok(0);
        };
        let end = end.ok_or_else(|| {
            Error::header(format!("Encapsulated has {what} without a following offset"))
        })?;
        end.checked_sub(start)
            .ok_or_else(|| Error::header(format!("Encapsulated {what} ends before it starts")))
    }

    /// Length of the embedded HTTP request head.
    pub fn request_head_len(&self, kind: RequestType) -> IcapResult<usize> {
        let end = match kind {
            RequestType::RespMod => self.res_hdr.or(self.res_body).or(self.null_body),
            _ => self.req_body.or(self.null_body),
        };
        Self::span(self.req_hdr, end, "req-hdr")
    }

    /// Length of the embedded HTTP response head (RESPMOD only).
    pub fn response_head_len(&self) -> IcapResult<usize> {
        Self::span(self.res_hdr, self.res_body.or(self.null_body), "res-hdr")
    }
}

/// Parse only the value of the `Encapsulated:` header (right side).
pub fn parse_encapsulated_value(val: &str) -> IcapResult<Encapsulated> {
    if val.trim().is_empty() {
        return Err(Error::header("empty Encapsulated header"));
    }

    let mut enc = Encapsulated::default();
    let mut offsets: Vec<usize> = Vec::new();

    for part in val.split(',') {
        let p = part.trim();
        let (name_raw, off_raw) = p
            .split_once('=')
            .ok_or_else(|| Error::Header(format!("invalid Encapsulated token: {p}")))?;

        let name = name_raw.trim().to_ascii_lowercase();
        let off: usize = off_raw
            .trim()
            .parse()
            .map_err(|_| Error::Header(format!("invalid Encapsulated offset: {off_raw}")))?;

        let slot = match name.as_str() {
            "req-hdr" => &mut enc.req_hdr,
            "res-hdr" => &mut enc.res_hdr,
            "req-body" => &mut enc.req_body,
            "res-body" => &mut enc.res_body,
            "opt-body" => &mut enc.opt_body,
            "null-body" => &mut enc.null_body,
            _ => {
                return Err(Error::Header(format!(
                    "invalid Encapsulated part name: {}",
                    name_raw.trim()
                )));
            }
        };

        if slot.replace(off).is_some() {
            return Err(Error::Header(format!(
                "duplicate Encapsulated part name: {}",
                name_raw.trim()
            )));
        }
        offsets.push(off);
    }

    for w in offsets.windows(2) {
        if w[1] < w[0] {
            return Err(Error::Header(format!(
                "Encapsulated offsets not monotonic: {} -> {}",
                w[0], w[1]
            )));
        }
    }

    if enc.null_body.is_some() && (enc.has_body() || enc.opt_body.is_some()) {
        return Err(Error::header(
            "Encapsulated declares both a body and null-body",
        ));
    }

    Ok(enc)
}

/// Oversized lines surface as `InvalidData` I/O errors but are a client
/// protocol error, not a socket failure.
fn is_socket_failure(e: &Error) -> bool {
    matches!(e, Error::Network(io) if io.kind() != std::io::ErrorKind::InvalidData)
}

/// Service path of an ICAP URI: `icap://host:1344/echo?x=1` -> `echo`.
fn service_of(uri: &str) -> &str {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path = rest.split_once('/').map_or("", |(_, path)| path);
    path.split('?').next().unwrap_or_default()
}

impl ExchangeState {
    /// Resets the state and parses the next ICAP request from `r`.
    ///
    /// Protocol errors yield [`RequestType::Invalid`]; only socket failures
    /// are returned as errors.
    pub async fn parse<R>(&mut self, r: &mut R) -> IcapResult<RequestType>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        self.reset();

        let kind = match self.parse_request_line(r).await {
            Ok(kind) => kind,
            Err(e) if is_socket_failure(&e) => return Err(e),
            Err(e) => {
                debug!(error = %e, "rejecting ICAP request line");
                RequestType::Invalid
            }
        };
        self.request_type = kind;

        if kind.is_modification() {
            let parsed = match self.parse_icap_headers(r).await {
                Ok(()) => self.parse_http_heads(r).await,
                Err(e) => Err(e),
            };
            match parsed {
                Ok(()) => {}
                Err(e) if is_socket_failure(&e) => return Err(e),
                Err(e) => {
                    debug!(error = %e, kind = %kind, "rejecting ICAP request");
                    self.request_type = RequestType::Invalid;
                }
            }
        }

        self.phase = match self.request_type {
            RequestType::Options => ParsePhase::Options,
            RequestType::ReqMod | RequestType::RespMod if self.has_body() => {
                ParsePhase::BodyNegotiation
            }
            RequestType::ReqMod | RequestType::RespMod => ParsePhase::Complete,
            _ => self.phase,
        };
        trace!(head = %self.icap_head, "parsed ICAP head");
        Ok(self.request_type)
    }

    async fn parse_request_line<R>(&mut self, r: &mut R) -> IcapResult<RequestType>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        self.phase = ParsePhase::AwaitingRequestLine;
        let line = loop {
            match read_line(r).await? {
                None => return Ok(RequestType::Empty),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
            }
        };

        if !["REQMOD", "RESPMOD", "OPTIONS"]
            .iter()
            .any(|m| line.starts_with(m))
        {
            return Err(Error::parse(format!(
                "unknown ICAP request line: {}",
                line.chars().take(64).collect::<String>()
            )));
        }
        self.icap_head.push_str(&line);
        self.icap_head.push_str("\r\n");

        let lower = line.to_ascii_lowercase();
        if lower.starts_with("options") {
            // OPTIONS carries no body; drain its headers.
            self.phase = ParsePhase::HeaderParsing;
            while let Some(header) = read_line(r).await? {
                if header.is_empty() {
                    break;
                }
                self.icap_head.push_str(&header);
                self.icap_head.push_str("\r\n");
            }
            return Ok(RequestType::Options);
        }

        let uri = line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| Error::parse("ICAP request line without URI"))?;
        self.service = service_of(uri).to_string();
        self.brand = if lower.contains("brand=netapp") {
            ClientBrand::NetApp
        } else {
            ClientBrand::Other
        };

        Ok(if lower.starts_with("reqmod") {
            RequestType::ReqMod
        } else {
            RequestType::RespMod
        })
    }

    async fn parse_icap_headers<R>(&mut self, r: &mut R) -> IcapResult<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        self.phase = ParsePhase::HeaderParsing;
        loop {
            let line = read_line(r)
                .await?
                .ok_or_else(|| Error::parse("EOF inside ICAP headers"))?;
            self.icap_head.push_str(&line);
            self.icap_head.push_str("\r\n");
            if line.is_empty() {
                return Ok(());
            }
            if self.icap_head.len() > MAX_HDR_BYTES {
                return Err(Error::header("ICAP headers exceed size limit"));
            }

            let Some((name, value)) = split_header(&line) else {
                debug!(line = %line, "ignoring ICAP header line without colon");
                continue;
            };
            let lname = name.to_ascii_lowercase();
            match lname.as_str() {
                "preview" => {
                    self.preview = Some(value.parse::<usize>().map_err(|_| {
                        Error::header(format!("invalid Preview value: {value}"))
                    })?);
                }
                "allow" => {
                    self.allow_204 = value.contains("204");
                    self.allow_206 = value.contains("206");
                }
                "encapsulated" => {
                    self.encapsulated = parse_encapsulated_value(value)?;
                    continue;
                }
                _ => {}
            }

            if BASE64_HEADERS.contains(&lname.as_str()) {
                match BASE64.decode(value.as_bytes()) {
                    Ok(decoded) => self
                        .icap_headers
                        .insert(&lname, String::from_utf8_lossy(&decoded)),
                    Err(e) => debug!(header = %lname, error = %e, "skipping undecodable header"),
                }
                continue;
            }
            self.icap_headers.insert(&lname, value);
        }
    }

    async fn parse_http_heads<R>(&mut self, r: &mut R) -> IcapResult<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let kind = self.request_type;
        let req_len = self.encapsulated.request_head_len(kind)?;
        let res_len = match kind {
            RequestType::RespMod => self.encapsulated.response_head_len()?,
            _ => 0,
        };
        if req_len > MAX_HDR_BYTES || res_len > MAX_HDR_BYTES {
            return Err(Error::header("encapsulated HTTP head exceeds size limit"));
        }

        if req_len > 0 {
            let got = read_exact_into(r, &mut self.req_header, req_len).await?;
            if got < req_len {
                return Err(Error::parse(format!(
                    "EOF inside HTTP request head: {got} of {req_len} bytes"
                )));
            }
            let head = parse_request_head(&self.req_header, &mut self.req_headers)?;
            self.first_line = head.first_line;
            self.http_method = head.method;
            self.url = head.url;
            self.url_path = head.path;
            self.query = head.query;
            self.host = head.host;
            self.content_length = head.content_length;
        }

        if res_len > 0 {
            let got = read_exact_into(r, &mut self.res_header, res_len).await?;
            if got < res_len {
                return Err(Error::parse(format!(
                    "EOF inside HTTP response head: {got} of {res_len} bytes"
                )));
            }
            let head = parse_response_head(&self.res_header, &mut self.res_headers)?;
            self.http_status = head.status;
            if head.content_length.is_some() {
                self.content_length = head.content_length;
            }
        }
        Ok(())
    }

    /// Reads the preview chunks announced by `Preview:` into the body buffer.
    ///
    /// Returns `false` when there is no preview to read or the first chunk
    /// header is unusable. Sets [`preview_starved`](Self::preview_starved) on
    /// `0; ieof`.
    pub async fn read_preview<R>(&mut self, r: &mut R) -> IcapResult<bool>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        if self.preview_read {
            return Ok(false);
        }
        self.preview_read = true;
        if self.preview.is_none() || !self.has_body() {
            return Ok(false);
        }
        self.phase = ParsePhase::PreviewRead;

        let mut header = match read_chunk_header(r).await {
            Ok(Some(header)) => header,
            Ok(None) => {
                debug!("EOF before preview chunk");
                return Ok(false);
            }
            Err(Error::MalformedChunk(msg)) => {
                debug!(error = %msg, "unreadable preview chunk");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        loop {
            if header.ieof {
                self.preview_starved = true;
                break;
            }
            if header.is_terminal() {
                break;
            }
            read_chunk_data(r, self.body_mut(), header.size).await?;
            header = match read_chunk_header(r).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(Error::MalformedChunk(msg)) => {
                    debug!(error = %msg, "stopping preview read on bad chunk");
                    break;
                }
                Err(e) => return Err(e),
            };
        }

        skip_trailing_crlf(r).await?;
        trace!(
            bytes = self.body().len(),
            starved = self.preview_starved,
            "preview read"
        );
        self.phase = if self.preview_starved {
            ParsePhase::Complete
        } else {
            ParsePhase::BodyNegotiation
        };
        Ok(true)
    }

    /// Reads the remainder of the body, sending `100 Continue` first when a
    /// preview was negotiated and did not already carry the whole body.
    ///
    /// Returns `true` when a body is present in the buffer. A second call
    /// does not touch the stream.
    pub async fn read_all_body<S>(&mut self, io: &mut S) -> IcapResult<bool>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + ?Sized,
    {
        if self.body_read {
            return Ok(self.has_body() && !self.body().is_empty());
        }
        self.body_read = true;
        if !self.has_body() {
            return Ok(false);
        }
        if self.preview.is_some() && !self.preview_read {
            self.read_preview(io).await?;
        }
        if self.preview_starved {
            self.phase = ParsePhase::Complete;
            return Ok(self.preview != Some(0) || !self.body().is_empty());
        }

        self.phase = ParsePhase::FullBodyRead;
        if self.preview.is_some() {
            io.write_all(CONTINUE_100).await?;
            io.flush().await?;
        }

        let mut header = read_chunk_header(io)
            .await?
            .ok_or_else(|| Error::malformed_chunk("EOF instead of chunk-size line"))?;
        while !header.is_terminal() {
            read_chunk_data(io, self.body_mut(), header.size).await?;
            header = match read_chunk_header(io).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(Error::MalformedChunk(msg)) => {
                    debug!(error = %msg, "stopping body read on bad chunk");
                    break;
                }
                Err(e) => return Err(e),
            };
        }
        skip_trailing_crlf(io).await?;

        self.phase = ParsePhase::Complete;
        trace!(bytes = self.body().len(), "body read");
        Ok(true)
    }
}
