//! Per-connection ICAP state machine.
//!
//! A [`Session`] owns one [`ExchangeState`] and one response buffer and
//! serves connections one at a time: a single exchange per connection when
//! the listener is pooled, a loop of exchanges when it keeps connections
//! alive. Buffers are reset between exchanges, never reallocated.
//!
//! Every socket read is bounded by the listener's idle timeout (see
//! [`IdleTimeout`]). A request that stalls before its response was written is
//! answered with `504`.

use crate::context::ListenerContext;
use crate::error::{Error, IcapResult};
use crate::exchange::{ClientBrand, ExchangeState, ParsePhase, RequestType};
use crate::net::IdleTimeout;
use crate::parser::wire::{BAD_REQUEST_400, SERVICE_TIMEOUT_504, read_exact_into};
use crate::pool::ConnectionHandler;
use crate::response::StatusCode;
use crate::service::{Exchange, IcapIo};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Bytes of the stray zero chunk NetApp filers send after a `204` to a
/// zero-byte preview.
const NETAPP_TRAILER_BYTES: usize = 5;

/// Upper bound for writing a `504` to a client that stopped talking.
const TIMEOUT_REPLY_GRACE: Duration = Duration::from_secs(1);

/// What the session does after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    KeepOpen,
    Close,
}

pub struct Session {
    id: usize,
    ctx: Arc<ListenerContext>,
    state: ExchangeState,
    response: Vec<u8>,
    // The response of the current exchange is on the wire.
    replied: bool,
    served: u64,
}

impl Session {
    pub fn new(id: usize, ctx: Arc<ListenerContext>) -> Self {
        Self {
            id,
            ctx,
            state: ExchangeState::new(),
            response: Vec::with_capacity(4096),
            replied: false,
            served: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Exchanges completed by this session over its lifetime.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Serves `stream` until the client leaves, an exchange fails, or (for
    /// non-persistent listeners) the first exchange is done. The stream is
    /// shut down on return.
    pub async fn serve<S>(&mut self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let _active = self.ctx.enter();
        let mut io = BufReader::new(IdleTimeout::new(stream, self.ctx.config().idle_timeout()));
        let client = peer.map(|p| p.to_string()).unwrap_or_default();
        trace!(service = %self.ctx.name(), worker = self.id, client = %client, "session started");

        loop {
            match self.await_request(&mut io).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log_failure(&e, self.ctx.name(), &client, "waiting for request");
                    break;
                }
            }

            let next = match self.exchange(&mut io, &client).await {
                Ok(next) => next,
                Err(e) if e.is_timeout() => {
                    debug!(service = %self.ctx.name(), client = %client, "client stopped sending");
                    if !self.replied && self.state.phase() != ParsePhase::AwaitingRequestLine {
                        let _ = timeout(TIMEOUT_REPLY_GRACE, reply(&mut io, SERVICE_TIMEOUT_504)).await;
                    }
                    Next::Close
                }
                Err(e) => {
                    log_failure(&e, self.ctx.name(), &client, "exchange failed");
                    Next::Close
                }
            };
            self.served += 1;

            if next == Next::Close || !self.ctx.keep_alive() || self.ctx.is_stopping() {
                break;
            }
        }

        if let Err(e) = io.get_mut().shutdown().await {
            trace!(error = %e, "socket shutdown");
        }
        trace!(service = %self.ctx.name(), worker = self.id, client = %client, "session closed");
    }

    /// Waits for the first byte of the next request. `false` means the
    /// connection should be closed without an exchange: EOF, idle timeout
    /// or listener shutdown.
    async fn await_request<S>(&self, io: &mut S) -> IcapResult<bool>
    where
        S: IcapIo,
    {
        tokio::select! {
            ready = io.fill_buf() => match ready {
                Ok(buf) => Ok(!buf.is_empty()),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    debug!(service = %self.ctx.name(), worker = self.id, "idle connection timed out");
                    Ok(false)
                }
                Err(e) => Err(Error::Network(e)),
            },
            _ = self.ctx.stopped() => Ok(false),
        }
    }

    /// Runs one ICAP exchange: parse, respond, write.
    async fn exchange<S>(&mut self, io: &mut S, client: &str) -> IcapResult<Next>
    where
        S: IcapIo,
    {
        self.replied = false;
        let kind = self.state.parse(io).await?;
        match kind {
            RequestType::Empty => return Ok(Next::Close),
            RequestType::Invalid => {
                reply(io, BAD_REQUEST_400).await?;
                self.access_log(client, StatusCode::BadRequest400);
                return Ok(Next::Close);
            }
            RequestType::Options => {
                reply(io, self.ctx.options_response()).await?;
                self.access_log(client, StatusCode::Ok200);
                return Ok(Next::KeepOpen);
            }
            RequestType::ReqMod | RequestType::RespMod => {}
        }

        if !self.ctx.service().supported_modes().supports(kind) {
            debug!(service = %self.ctx.name(), method = %kind, "method not offered by service");
            reply(io, BAD_REQUEST_400).await?;
            self.access_log(client, StatusCode::BadRequest400);
            return Ok(Next::Close);
        }

        match self.state.read_preview(io).await {
            Ok(_) => {}
            Err(e) if e.is_protocol() => return self.reject(io, client, &e).await,
            Err(e) => return Err(e),
        }

        self.response.clear();
        let (result, close) = {
            let mut exchange = Exchange::new(&mut self.state, io, &mut self.response, &self.ctx);
            let result = self.ctx.service().respond(&mut exchange).await;
            (result, exchange.close_requested())
        };

        let status = match result {
            Ok(status) => status,
            Err(e) if e.is_protocol() => return self.reject(io, client, &e).await,
            Err(e) => return Err(e),
        };
        reply(io, &self.response).await?;
        self.replied = true;

        if status == StatusCode::NoContent204 && self.expects_netapp_trailer() {
            let mut scratch = Vec::with_capacity(NETAPP_TRAILER_BYTES);
            let drained = read_exact_into(io, &mut scratch, NETAPP_TRAILER_BYTES).await?;
            trace!(drained, "skipped NetApp zero chunk");
        }

        self.access_log(client, status);
        Ok(if close { Next::Close } else { Next::KeepOpen })
    }

    /// NetApp keeps sending the zero chunk of a `Preview: 0` REQMOD body
    /// even after it got a `204`.
    fn expects_netapp_trailer(&self) -> bool {
        self.state.brand() == ClientBrand::NetApp
            && self.state.request_type() == RequestType::ReqMod
            && self.state.preview() == Some(0)
            && !self.state.body_read()
            && self.state.content_length().is_some_and(|len| len > 0)
    }

    async fn reject<S>(&self, io: &mut S, client: &str, e: &Error) -> IcapResult<Next>
    where
        S: IcapIo,
    {
        debug!(service = %self.ctx.name(), client = %client, error = %e, "bad request");
        reply(io, BAD_REQUEST_400).await?;
        self.access_log(client, StatusCode::BadRequest400);
        Ok(Next::Close)
    }

    fn access_log(&self, client: &str, status: StatusCode) {
        info!(
            target: "icap::access",
            service = %self.ctx.name(),
            client = %client,
            kind = %self.state.request_type(),
            status = status.as_u16(),
            method = %self.state.http_method(),
            url = %self.state.url(),
            elapsed_ms = self.state.elapsed().as_millis() as u64,
            "icap exchange"
        );
    }
}

async fn reply<S>(io: &mut S, bytes: &[u8]) -> IcapResult<()>
where
    S: IcapIo,
{
    io.write_all(bytes).await?;
    io.flush().await?;
    Ok(())
}

fn log_failure(e: &Error, service: &str, client: &str, what: &str) {
    if e.is_transport() {
        debug!(service = %service, client = %client, error = %e, "{what}");
    } else {
        warn!(service = %service, client = %client, error = %e, "{what}");
    }
}

#[async_trait]
impl<S> ConnectionHandler<(S, SocketAddr)> for Session
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&mut self, (stream, peer): (S, SocketAddr)) {
        self.serve(stream, Some(peer)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::services::{EchoService, PreviewService};
    use crate::service::{AdaptationService, VectoringPoint};
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    const REQ_HEAD: &str = "GET /form HTTP/1.1\r\nHost: origin.test\r\nContent-Length: 5\r\n\r\n";

    fn context(config: ListenerConfig, service: Arc<dyn AdaptationService>) -> Arc<ListenerContext> {
        Arc::new(ListenerContext::new(
            config,
            service,
            "127.0.0.1:1344".parse().unwrap(),
        ))
    }

    fn reqmod(extra: &str, body: &str) -> String {
        format!(
            "REQMOD icap://127.0.0.1/echo ICAP/1.0\r\nHost: 127.0.0.1\r\n{extra}Encapsulated: req-hdr=0, req-body={}\r\n\r\n{REQ_HEAD}{body}",
            REQ_HEAD.len()
        )
    }

    async fn run(ctx: Arc<ListenerContext>, input: String) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let mut session = Session::new(0, ctx);
        let task = tokio::spawn(async move {
            session.serve(server, None).await;
            session
        });
        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    #[tokio::test]
    async fn echo_returns_the_unmodified_request() {
        let ctx = context(ListenerConfig::new("echo"), Arc::new(EchoService));
        let out = run(ctx, reqmod("", "5\r\nhello\r\n0\r\n\r\n")).await;

        assert!(out.starts_with("ICAP/1.0 200 OK\r\n"), "{out}");
        assert!(out.contains(&format!("Encapsulated: req-hdr=0, req-body={}\r\n", REQ_HEAD.len())));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with(&format!("{REQ_HEAD}5\r\nhello\r\n0\r\n\r\n")));
    }

    #[tokio::test]
    async fn options_then_reqmod_on_a_persistent_connection() {
        let config = ListenerConfig::new("echo").with_keep_alive(true);
        let ctx = context(config, Arc::new(EchoService));
        let input = format!(
            "OPTIONS icap://127.0.0.1/echo ICAP/1.0\r\nHost: 127.0.0.1\r\n\r\n{}",
            reqmod("", "5\r\nhello\r\n0\r\n\r\n")
        );
        let out = run(ctx, input).await;

        let options_at = out.find("Methods: REQMOD, RESPMOD").unwrap();
        let reqmod_at = out.rfind("ICAP/1.0 200 OK").unwrap();
        assert!(options_at < reqmod_at);
        assert!(out.contains("Connection: keep-alive\r\n"));
    }

    #[tokio::test]
    async fn pooled_session_stops_after_one_exchange() {
        let ctx = context(ListenerConfig::new("echo"), Arc::new(EchoService));
        let input = "OPTIONS icap://127.0.0.1/echo ICAP/1.0\r\n\r\n".repeat(2);
        let out = run(ctx, input).await;
        assert_eq!(out.matches("ICAP/1.0 200 OK").count(), 1);
    }

    #[tokio::test]
    async fn garbage_gets_400() {
        let ctx = context(ListenerConfig::new("echo"), Arc::new(EchoService));
        let out = run(ctx, "GET / HTTP/1.1\r\n\r\n".to_string()).await;
        assert_eq!(out, "ICAP/1.0 400 Bad Request\r\n\r\n");
    }

    #[tokio::test]
    async fn unsupported_method_gets_400() {
        let ctx = context(ListenerConfig::new("preview"), Arc::new(PreviewService));
        let out = run(ctx, reqmod("", "5\r\nhello\r\n0\r\n\r\n")).await;
        assert_eq!(out, "ICAP/1.0 400 Bad Request\r\n\r\n");
    }

    #[tokio::test]
    async fn allow_204_short_circuits_without_reading_the_body() {
        let config = ListenerConfig::new("echo").with_keep_alive(true);
        let ctx = context(config, Arc::new(PreviewService));
        let input = "RESPMOD icap://127.0.0.1/preview ICAP/1.0\r\nAllow: 204\r\nEncapsulated: res-hdr=0, res-body=19\r\n\r\nHTTP/1.1 200 OK\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
            .to_string();
        let out = run(ctx, input).await;
        assert!(out.starts_with("ICAP/1.0 204 No Content\r\n"), "{out}");
        assert!(out.contains("Encapsulated: null-body=0\r\n"));
    }

    #[tokio::test]
    async fn bad_chunk_after_preview_is_rejected() {
        let ctx = context(ListenerConfig::new("echo"), Arc::new(EchoService));
        let input = reqmod("Preview: 2\r\n", "2\r\nhe\r\n0\r\n\r\nzz\r\n");
        let out = run(ctx, input).await;
        assert!(out.starts_with("ICAP/1.0 100 Continue\r\n\r\n"), "{out}");
        assert!(out.ends_with("ICAP/1.0 400 Bad Request\r\n\r\n"));
    }

    #[tokio::test]
    async fn stopped_listener_closes_idle_connection() {
        let config = ListenerConfig::new("echo").with_keep_alive(true);
        let ctx = context(config, Arc::new(EchoService));
        let (_client, server) = duplex(1024);
        let mut session = Session::new(3, Arc::clone(&ctx));
        let task = tokio::spawn(async move { session.serve(server, None).await });

        while ctx.active_sessions() == 0 {
            tokio::task::yield_now().await;
        }
        ctx.stop();
        task.await.unwrap();
        assert_eq!(ctx.active_sessions(), 0);
    }

    /// Answers every REQMOD with the cheapest unmodified response.
    struct Unmodified;

    #[async_trait]
    impl AdaptationService for Unmodified {
        fn name(&self) -> &str {
            "unmodified"
        }

        fn description(&self) -> &str {
            "early response"
        }

        fn supported_modes(&self) -> VectoringPoint {
            VectoringPoint::ReqMod
        }

        async fn respond(&self, ex: &mut Exchange<'_>) -> IcapResult<StatusCode> {
            ex.early_response().await
        }
    }

    fn zero_preview(target: &str) -> String {
        format!(
            "REQMOD icap://filer/{target} ICAP/1.0\r\nHost: filer\r\nPreview: 0\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n{REQ_HEAD}0\r\n\r\n",
            REQ_HEAD.len()
        )
    }

    const OPTIONS: &str = "OPTIONS icap://filer/echo ICAP/1.0\r\nHost: filer\r\n\r\n";

    fn spawn_session(ctx: Arc<ListenerContext>) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = duplex(64 * 1024);
        let mut session = Session::new(0, ctx);
        let task = tokio::spawn(async move { session.serve(server, None).await });
        (client, task)
    }

    #[tokio::test]
    async fn netapp_stray_zero_chunk_is_drained_after_204() {
        let config = ListenerConfig::new("echo").with_keep_alive(true);
        let ctx = context(config, Arc::new(Unmodified));
        let input = format!("{}0\r\n\r\n{OPTIONS}", zero_preview("echo?brand=NetApp"));
        let out = run(ctx, input).await;

        assert!(out.starts_with("ICAP/1.0 204 No Content\r\n"), "{out}");
        let options_at = out.find("ICAP/1.0 200 OK\r\n").expect("second request answered");
        assert!(out[options_at..].contains("Methods: REQMOD"));
        assert!(!out.contains("400 Bad Request"));
    }

    #[tokio::test]
    async fn other_clients_get_no_drain_after_204() {
        let config = ListenerConfig::new("echo").with_keep_alive(true);
        let ctx = context(config, Arc::new(Unmodified));
        let input = format!("{}{OPTIONS}", zero_preview("echo"));
        let out = run(ctx, input).await;

        assert!(out.starts_with("ICAP/1.0 204 No Content\r\n"), "{out}");
        let options_at = out.find("ICAP/1.0 200 OK\r\n").expect("second request answered");
        assert!(out[options_at..].contains("Methods: REQMOD"));
        assert!(!out.contains("400 Bad Request"));
    }

    #[tokio::test]
    async fn missing_netapp_trailer_closes_without_504() {
        let config = ListenerConfig::new("echo")
            .with_keep_alive(true)
            .with_idle_timeout(Duration::from_secs(1));
        let ctx = context(config, Arc::new(Unmodified));
        let (mut client, task) = spawn_session(ctx);

        client.write_all(zero_preview("echo?brand=NetApp").as_bytes()).await.unwrap();
        let mut out = String::new();
        timeout(Duration::from_secs(5), client.read_to_string(&mut out))
            .await
            .expect("session closes after the idle timeout")
            .unwrap();
        task.await.unwrap();

        assert!(out.starts_with("ICAP/1.0 204 No Content\r\n"), "{out}");
        assert!(!out.contains("Service timeout"), "{out}");
    }

    #[tokio::test]
    async fn slow_steady_body_is_not_timed_out() {
        let config = ListenerConfig::new("echo").with_idle_timeout(Duration::from_secs(1));
        let ctx = context(config, Arc::new(EchoService));
        let (mut client, task) = spawn_session(ctx);

        let head = reqmod("", "");
        client.write_all(head.as_bytes()).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            client.write_all(b"1\r\nx\r\n").await.unwrap();
        }
        client.write_all(b"0\r\n\r\n").await.unwrap();

        let mut out = String::new();
        timeout(Duration::from_secs(5), client.read_to_string(&mut out))
            .await
            .expect("pooled session closes after its exchange")
            .unwrap();
        task.await.unwrap();

        assert!(out.starts_with("ICAP/1.0 200 OK\r\n"), "{out}");
        assert!(out.contains("4\r\nxxxx\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn stalled_body_gets_504() {
        let config = ListenerConfig::new("echo").with_idle_timeout(Duration::from_secs(1));
        let ctx = context(config, Arc::new(EchoService));
        let (mut client, task) = spawn_session(ctx);

        client.write_all(reqmod("", "1\r\nx\r\n").as_bytes()).await.unwrap();
        let mut out = String::new();
        timeout(Duration::from_secs(5), client.read_to_string(&mut out))
            .await
            .expect("stalled exchange ends")
            .unwrap();
        task.await.unwrap();

        assert_eq!(out, "ICAP/1.0 504 Service timeout\r\n\r\n");
    }

    #[tokio::test]
    async fn oversized_chunk_size_ends_the_exchange() {
        let ctx = context(ListenerConfig::new("echo"), Arc::new(EchoService));
        let chunks = format!("{:X}\r\nabc", usize::MAX);
        let out = run(Arc::clone(&ctx), reqmod("", &chunks)).await;
        assert!(!out.starts_with("ICAP/1.0 200"), "{out}");
        assert_eq!(ctx.active_sessions(), 0);
    }
}
