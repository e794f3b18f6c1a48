mod common;

use async_trait::async_trait;
use common::{options, reqmod, roundtrip, spawn, status_of};
use icap_engine::config::ListenerConfig;
use icap_engine::error::IcapResult;
use icap_engine::response::StatusCode;
use icap_engine::service::{AdaptationService, Exchange, VectoringPoint};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Records the order in which exchanges are served, slowly.
#[derive(Default)]
struct Slow {
    served: Mutex<Vec<String>>,
}

#[async_trait]
impl AdaptationService for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "answers 204 after a delay"
    }

    fn supported_modes(&self) -> VectoringPoint {
        VectoringPoint::ReqMod
    }

    async fn respond(&self, ex: &mut Exchange<'_>) -> IcapResult<StatusCode> {
        self.served.lock().push(ex.state().service().to_string());
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(ex.no_content())
    }
}

#[tokio::test]
async fn pooled_connections_wait_their_turn() {
    let slow = Arc::new(Slow::default());
    let config = ListenerConfig::new("slow").with_pool_size(1);
    let service: Arc<dyn AdaptationService> = slow.clone();
    let listener = spawn(config, Some(service)).await;
    let addr = listener.local_addr();
    assert_eq!(listener.pool_stats().map(|s| s.size), Some(1));

    let mut clients = Vec::new();
    for seq in 0..3 {
        let request = reqmod(&format!("slow{seq}"), "", "5\r\nhello\r\n0\r\n\r\n");
        clients.push(tokio::spawn(async move { roundtrip(addr, request.as_bytes()).await }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    for client in clients {
        let out = client.await.expect("client task");
        assert_eq!(status_of(&out), Some(204));
    }
    assert_eq!(*slow.served.lock(), vec!["slow0", "slow1", "slow2"]);
    assert_eq!(listener.pool_stats().map(|s| s.pending), Some(0));
}

#[tokio::test]
async fn keep_alive_listener_has_no_pool() {
    let listener = spawn(ListenerConfig::new("echo").with_keep_alive(true), None).await;
    assert!(listener.pool_stats().is_none());
}

#[tokio::test]
async fn absurd_chunk_size_does_not_cost_a_worker() {
    let listener = spawn(ListenerConfig::new("echo").with_pool_size(1), None).await;
    let addr = listener.local_addr();

    let chunks = format!("{:X}\r\nabc", usize::MAX);
    let out = roundtrip(addr, reqmod("echo", "", &chunks).as_bytes()).await;
    assert_ne!(status_of(&out), Some(200));

    let out = roundtrip(addr, options("echo").as_bytes()).await;
    assert_eq!(status_of(&out), Some(200));
    assert_eq!(listener.pool_stats().map(|s| s.size), Some(1));
}
