#![allow(dead_code)]

use icap_engine::config::ListenerConfig;
use icap_engine::server::{Listener, ListenerHandle};
use icap_engine::service::AdaptationService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const REQ_HEAD: &str = "GET /index.html HTTP/1.1\r\nHost: origin.test\r\nContent-Length: 5\r\n\r\n";
pub const RES_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\n";

/// Binds `config` on an ephemeral loopback port and spawns its accept loop.
pub async fn spawn(config: ListenerConfig, service: Option<Arc<dyn AdaptationService>>) -> ListenerHandle {
    let config = config.with_bind("127.0.0.1").with_port(0);
    let builder = Listener::builder(config);
    let builder = match service {
        Some(service) => builder.service(service),
        None => builder,
    };
    builder.build().await.expect("listener binds").spawn()
}

/// Sends `request`, half-closes, and reads until the server closes.
pub async fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request).await.expect("write request");
    stream.shutdown().await.expect("half-close");
    let mut out = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server answers in time")
        .expect("read response");
    String::from_utf8_lossy(&out).into_owned()
}

pub fn status_of(response: &str) -> Option<u16> {
    let line = response.lines().next()?;
    let mut parts = line.split(' ');
    if !parts.next()?.starts_with("ICAP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

pub fn options(service: &str) -> String {
    format!("OPTIONS icap://127.0.0.1/{service} ICAP/1.0\r\nHost: 127.0.0.1\r\n\r\n")
}

/// REQMOD carrying [`REQ_HEAD`] and `chunks` (already chunk-encoded).
pub fn reqmod(service: &str, extra: &str, chunks: &str) -> String {
    format!(
        "REQMOD icap://127.0.0.1/{service} ICAP/1.0\r\nHost: 127.0.0.1\r\n{extra}Encapsulated: req-hdr=0, req-body={}\r\n\r\n{REQ_HEAD}{chunks}",
        REQ_HEAD.len()
    )
}

/// RESPMOD carrying [`REQ_HEAD`], [`RES_HEAD`] and `chunks`.
pub fn respmod(service: &str, extra: &str, chunks: &str) -> String {
    format!(
        "RESPMOD icap://127.0.0.1/{service} ICAP/1.0\r\nHost: 127.0.0.1\r\n{extra}Encapsulated: req-hdr=0, res-hdr={}, res-body={}\r\n\r\n{REQ_HEAD}{RES_HEAD}{chunks}",
        REQ_HEAD.len(),
        REQ_HEAD.len() + RES_HEAD.len()
    )
}
