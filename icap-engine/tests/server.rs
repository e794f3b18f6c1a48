mod common;

use common::{REQ_HEAD, RES_HEAD, options, reqmod, respmod, roundtrip, spawn, status_of};
use icap_engine::config::ListenerConfig;
use icap_engine::VERSION;

#[tokio::test]
async fn options_advertises_the_service() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let out = roundtrip(listener.local_addr(), options("echo").as_bytes()).await;

    assert_eq!(status_of(&out), Some(200));
    assert!(out.contains(&format!("ISTag: \"echo-{VERSION}\"\r\n")));
    assert!(out.contains("Methods: REQMOD, RESPMOD\r\n"));
    assert!(out.contains("Max-Connections: 100\r\n"));
    assert!(out.ends_with("Encapsulated: null-body=0\r\n\r\n"));
    listener.stop();
}

#[tokio::test]
async fn options_headers_are_drained_before_answering() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let request = "OPTIONS icap://127.0.0.1/echo ICAP/1.0\r\nHost: 127.0.0.1\r\nUser-Agent: test\r\nEncapsulated: null-body=0\r\n\r\nunrelated trailing bytes";
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;

    assert_eq!(status_of(&out), Some(200));
    assert_eq!(out.matches("ICAP/1.0").count(), 1);
    assert!(!out.contains("400"));
}

#[tokio::test]
async fn reqmod_without_body_echoes_the_head() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let request = format!(
        "REQMOD icap://127.0.0.1/echo ICAP/1.0\r\nHost: 127.0.0.1\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n{REQ_HEAD}",
        REQ_HEAD.len()
    );
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;

    assert_eq!(status_of(&out), Some(200));
    assert!(out.contains(&format!("Encapsulated: req-hdr=0, null-body={}\r\n", REQ_HEAD.len())));
    assert!(out.ends_with(REQ_HEAD));
}

#[tokio::test]
async fn reqmod_body_is_echoed_chunked() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let request = reqmod("echo", "", "3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n");
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;

    assert_eq!(status_of(&out), Some(200));
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with(&format!("{REQ_HEAD}5\r\nhello\r\n0\r\n\r\n")));
}

#[tokio::test]
async fn respmod_echoes_the_response() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let request = respmod("echo", "", "A\r\n0123456789\r\n0\r\n\r\n");
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;

    assert_eq!(status_of(&out), Some(200));
    assert!(out.contains(&format!("Encapsulated: res-hdr=0, res-body={}\r\n", RES_HEAD.len())));
    assert!(out.ends_with(&format!("{RES_HEAD}A\r\n0123456789\r\n0\r\n\r\n")));
}

#[tokio::test]
async fn keep_alive_serves_several_exchanges() {
    let listener = spawn(ListenerConfig::new("echo").with_keep_alive(true), None).await;
    let request = format!(
        "{}{}{}",
        options("echo"),
        reqmod("echo", "", "5\r\nhello\r\n0\r\n\r\n"),
        respmod("echo", "", "A\r\n0123456789\r\n0\r\n\r\n"),
    );
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;

    assert_eq!(out.matches("ICAP/1.0 200 OK\r\n").count(), 3);
    assert_eq!(out.matches("Connection: keep-alive\r\n").count(), 2);
}

#[tokio::test]
async fn pooled_listener_closes_after_one_exchange() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let request = format!("{}{}", options("echo"), options("echo"));
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;
    assert_eq!(out.matches("ICAP/1.0 200 OK\r\n").count(), 1);
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let listener = spawn(ListenerConfig::new("echo").with_keep_alive(true), None).await;
    let out = roundtrip(listener.local_addr(), b"HELLO icap://127.0.0.1/echo ICAP/1.0\r\n\r\n").await;
    assert_eq!(out, "ICAP/1.0 400 Bad Request\r\n\r\n");
}

#[tokio::test]
async fn bad_encapsulated_header_gets_400() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let request = "REQMOD icap://127.0.0.1/echo ICAP/1.0\r\nEncapsulated: req-hdr=10, req-body=2\r\n\r\n";
    let out = roundtrip(listener.local_addr(), request.as_bytes()).await;
    assert_eq!(status_of(&out), Some(400));
}

#[tokio::test]
async fn stopped_listener_refuses_new_connections() {
    let listener = spawn(ListenerConfig::new("echo"), None).await;
    let addr = listener.local_addr();
    listener.stop();
    listener.join().await.expect("accept loop ends cleanly");

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
