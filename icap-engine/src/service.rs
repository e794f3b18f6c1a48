//! Adaptation service interface.
//!
//! A listener hands every REQMOD/RESPMOD exchange to one
//! [`AdaptationService`]. The service sees the parsed request through an
//! [`Exchange`], may pull the remainder of the body, and fills the response
//! buffer using the helpers below (`early_response`, `full_response`, ...).
//!
//! ```no_run
//! use async_trait::async_trait;
//! use icap_engine::error::IcapResult;
//! use icap_engine::response::StatusCode;
//! use icap_engine::service::{AdaptationService, Exchange, VectoringPoint};
//!
//! struct Blocker;
//!
//! #[async_trait]
//! impl AdaptationService for Blocker {
//!     fn name(&self) -> &str { "blocker" }
//!     fn description(&self) -> &str { "rejects uploads to example.com" }
//!     fn supported_modes(&self) -> VectoringPoint { VectoringPoint::ReqMod }
//!
//!     async fn respond(&self, ex: &mut Exchange<'_>) -> IcapResult<StatusCode> {
//!         if ex.state().host() == Some("example.com") {
//!             ex.get_all_body().await?;
//!             ex.state_mut().body_mut().clear();
//!             ex.state_mut().update_content_length(0);
//!             return Ok(ex.full_response());
//!         }
//!         ex.early_response().await
//!     }
//! }
//! ```

use crate::codec::ContentCoding;
use crate::config::ListenerConfig;
use crate::context::ListenerContext;
use crate::error::IcapResult;
use crate::exchange::{ExchangeState, RequestType};
use crate::parser::wire::{
    self, HEAD_CONNECTION_CLOSE, HEAD_CONNECTION_KEEPALIVE, OK_200, SERVER_ERROR_500,
};
use crate::response::StatusCode;
use async_trait::async_trait;
use smallvec::{SmallVec, smallvec};
use std::fmt;
use std::fmt::Write as _;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::trace;

/// ICAP modification methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcapMethod {
    ReqMod,
    RespMod,
}

impl fmt::Display for IcapMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IcapMethod::ReqMod => "REQMOD",
            IcapMethod::RespMod => "RESPMOD",
        })
    }
}

/// Where in the proxy flow a service applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectoringPoint {
    ReqMod,
    RespMod,
    ReqModRespMod,
}

impl VectoringPoint {
    pub fn methods(self) -> SmallVec<[IcapMethod; 2]> {
        match self {
            VectoringPoint::ReqMod => smallvec![IcapMethod::ReqMod],
            VectoringPoint::RespMod => smallvec![IcapMethod::RespMod],
            VectoringPoint::ReqModRespMod => smallvec![IcapMethod::ReqMod, IcapMethod::RespMod],
        }
    }

    pub fn supports(self, kind: RequestType) -> bool {
        match kind {
            RequestType::ReqMod => self != VectoringPoint::RespMod,
            RequestType::RespMod => self != VectoringPoint::ReqMod,
            _ => false,
        }
    }
}

/// Byte stream of a client connection.
pub trait IcapIo: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T> IcapIo for T where T: AsyncBufRead + AsyncWrite + Unpin + Send {}

/// Content adaptation logic plugged into a listener.
#[async_trait]
pub trait AdaptationService: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Methods advertised by OPTIONS.
    fn supported_modes(&self) -> VectoringPoint;

    /// Produces the response of one REQMOD/RESPMOD exchange into the
    /// exchange's response buffer and returns its status.
    async fn respond(&self, exchange: &mut Exchange<'_>) -> IcapResult<StatusCode>;
}

/// One exchange as seen by an [`AdaptationService`].
pub struct Exchange<'a> {
    state: &'a mut ExchangeState,
    io: &'a mut dyn IcapIo,
    response: &'a mut Vec<u8>,
    ctx: &'a ListenerContext,
    close: bool,
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        state: &'a mut ExchangeState,
        io: &'a mut dyn IcapIo,
        response: &'a mut Vec<u8>,
        ctx: &'a ListenerContext,
    ) -> Self {
        Self {
            state,
            io,
            response,
            ctx,
            close: false,
        }
    }

    pub fn state(&self) -> &ExchangeState {
        &*self.state
    }

    pub fn state_mut(&mut self) -> &mut ExchangeState {
        &mut *self.state
    }

    pub fn request_type(&self) -> RequestType {
        self.state.request_type()
    }

    pub fn config(&self) -> &ListenerConfig {
        self.ctx.config()
    }

    /// Bytes that will be written to the client once the service returns.
    pub fn response(&self) -> &[u8] {
        self.response.as_slice()
    }

    pub fn response_mut(&mut self) -> &mut Vec<u8> {
        &mut *self.response
    }

    /// Ends the connection after this exchange.
    pub fn close_connection(&mut self) {
        self.close = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close
    }

    /// Reads the rest of the body (sending `100 Continue` if a preview was
    /// negotiated). Returns `true` when a body is available.
    pub async fn get_all_body(&mut self) -> IcapResult<bool> {
        self.state.read_all_body(&mut *self.io).await
    }

    /// Answers "unmodified" as cheaply as the client allows: `204` when it
    /// sent `Allow: 204` or is still in preview, the full unchanged message
    /// otherwise.
    pub async fn early_response(&mut self) -> IcapResult<StatusCode> {
        let in_preview = self.state.preview().is_some() && !self.state.body_read();
        if self.state.allow_204() || in_preview {
            if !in_preview && self.state.has_body() && !self.state.body_read() {
                // The unread body is still queued on the socket.
                self.close = true;
            }
            return Ok(self.no_content());
        }
        self.get_all_body().await?;
        Ok(self.full_response())
    }

    /// `200 OK` carrying the current HTTP head and body of the message under
    /// adaptation, body chunked to TCP segments.
    pub fn full_response(&mut self) -> StatusCode {
        if !self.state.request_type().is_modification() {
            return self.server_error();
        }
        let state = &*self.state;
        let (prefix, head, body) = match state.request_type() {
            RequestType::ReqMod => ("req", state.request_header(), state.request_body()),
            _ => ("res", state.response_header(), state.response_body()),
        };

        let mut icap = String::with_capacity(160);
        icap.push_str(OK_200);
        icap.push_str(self.ctx.istag_line());
        icap.push_str(self.ctx.host_line());
        icap.push_str("Encapsulated: ");
        let body_tag = if body.is_empty() {
            "null-body".to_string()
        } else {
            format!("{prefix}-body")
        };
        if head.is_empty() {
            let _ = write!(icap, "{body_tag}=0\r\n");
        } else {
            let _ = write!(icap, "{prefix}-hdr=0, {body_tag}={}\r\n", head.len());
        }
        if self.ctx.keep_alive() {
            icap.push_str(HEAD_CONNECTION_KEEPALIVE);
        } else {
            icap.push_str(HEAD_CONNECTION_CLOSE);
            self.close = true;
        }
        icap.push_str("\r\n");

        let out = &mut *self.response;
        out.clear();
        out.extend_from_slice(icap.as_bytes());
        out.extend_from_slice(head);
        let queued = out.len();
        wire::write_chunks_into(out, queued, body);
        trace!(head = head.len(), body = body.len(), "full response assembled");
        StatusCode::Ok200
    }

    pub fn no_content(&mut self) -> StatusCode {
        self.response.clear();
        self.response
            .extend_from_slice(self.ctx.no_content_response());
        StatusCode::NoContent204
    }

    pub fn server_error(&mut self) -> StatusCode {
        self.response.clear();
        self.response.extend_from_slice(SERVER_ERROR_500);
        StatusCode::InternalServerError500
    }

    /// Sets the HTTP `Content-Length` of the message under adaptation.
    pub fn update_content_length(&mut self, length: u64) {
        self.state.update_content_length(length);
    }

    pub fn update_content_type(&mut self, content_type: &str) {
        self.state.update_content_type(content_type);
    }

    pub fn is_compressed(&self) -> bool {
        self.state.is_compressed()
    }

    /// Decodes the body under adaptation in place.
    pub fn uncompress(&mut self) -> IcapResult<bool> {
        self.state.uncompress_body()
    }

    /// Re-encodes the body under adaptation.
    pub fn compress(&mut self) -> IcapResult<ContentCoding> {
        self.state.compress_body()
    }

    pub fn character_encoding(&self) -> String {
        self.state.character_encoding()
    }
}
