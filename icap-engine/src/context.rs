//! State shared by every session of one listener.

use crate::config::ListenerConfig;
use crate::parser::wire::{CRLF, NO_CONTENT_204};
use crate::server::options::ServiceOptions;
use crate::service::AdaptationService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// Configuration, service and pre-rendered responses of a listener.
pub struct ListenerContext {
    config: ListenerConfig,
    service: Arc<dyn AdaptationService>,
    options: ServiceOptions,
    options_response: Vec<u8>,
    no_content: Vec<u8>,
    istag_line: String,
    host_line: String,
    local_addr: SocketAddr,
    active: AtomicUsize,
    stopping: watch::Sender<bool>,
}

impl ListenerContext {
    pub fn new(
        config: ListenerConfig,
        service: Arc<dyn AdaptationService>,
        local_addr: SocketAddr,
    ) -> Self {
        let options = ServiceOptions::from_config(&config, service.supported_modes());
        let options_response = options.render();
        let istag_line = format!("{}\r\n", options.istag_header());

        let mut no_content = Vec::with_capacity(96);
        no_content.extend_from_slice(NO_CONTENT_204.as_bytes());
        no_content.extend_from_slice(istag_line.as_bytes());
        no_content.extend_from_slice(b"Encapsulated: null-body=0\r\n");
        no_content.extend_from_slice(CRLF);

        Self {
            host_line: format!("Host: {local_addr}\r\n"),
            config,
            service,
            options,
            options_response,
            no_content,
            istag_line,
            local_addr,
            active: AtomicUsize::new(0),
            stopping: watch::Sender::new(false),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn service(&self) -> &Arc<dyn AdaptationService> {
        &self.service
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn options_response(&self) -> &[u8] {
        &self.options_response
    }

    pub fn no_content_response(&self) -> &[u8] {
        &self.no_content
    }

    /// `ISTag: "..."\r\n`
    pub fn istag_line(&self) -> &str {
        &self.istag_line
    }

    /// `Host: <ip>:<port>\r\n` of the listening socket.
    pub fn host_line(&self) -> &str {
        &self.host_line
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn keep_alive(&self) -> bool {
        self.config.keep_alive
    }

    /// Connections currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Asks the accept loop and idle sessions of this listener to finish.
    pub fn stop(&self) {
        self.stopping.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.stopping.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    pub(crate) fn enter(self: &Arc<Self>) -> ActiveSession {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveSession(Arc::clone(self))
    }
}

/// Counts a connection as active until dropped.
pub(crate) struct ActiveSession(Arc<ListenerContext>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}
