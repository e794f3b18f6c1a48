//! Multi-listener supervisor.
//!
//! [`IcapServer`] starts one [`Listener`] per configured service and
//! implements the administrative stop and restart sequence: stop every
//! listener, wait (bounded) for their sessions to end, rebuild from the new
//! configuration.

use crate::config::ServerConfig;
use crate::error::{Error, IcapResult};
use crate::server::{Listener, ListenerHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Interval between two checks for terminated listeners.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Checks before the remaining sessions are abandoned.
pub const SHUTDOWN_POLL_ATTEMPTS: u32 = 1000;

pub struct IcapServer {
    listeners: Vec<ListenerHandle>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl IcapServer {
    /// Binds and starts every listener of `config`.
    ///
    /// A listener that cannot start is logged and skipped; the call fails
    /// only when no listener could be started.
    pub async fn start(config: &ServerConfig) -> IcapResult<Self> {
        config.validate()?;

        let mut listeners = Vec::with_capacity(config.listeners.len());
        let mut last_error = None;
        for listener_config in &config.listeners {
            let name = listener_config.name.clone();
            match Listener::builder(listener_config.clone()).build().await {
                Ok(listener) => listeners.push(listener.spawn()),
                Err(e) => {
                    error!(service = %name, error = %e, "cannot start ICAP listener");
                    last_error = Some(e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(last_error.unwrap_or_else(|| Error::configuration("no listener configured")));
        }
        info!(listeners = listeners.len(), "ICAP server started");
        Ok(Self {
            listeners,
            poll_interval: SHUTDOWN_POLL_INTERVAL,
            poll_attempts: SHUTDOWN_POLL_ATTEMPTS,
        })
    }

    /// Overrides the bounded wait used by [`shutdown`](Self::shutdown) and
    /// [`restart`](Self::restart).
    pub fn with_shutdown_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts;
        self
    }

    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    pub fn listener(&self, name: &str) -> Option<&ListenerHandle> {
        self.listeners.iter().find(|l| l.name() == name)
    }

    /// Asks every listener to stop. Does not wait.
    pub fn stop(&self) {
        for listener in &self.listeners {
            listener.stop();
        }
    }

    /// Stops every listener and waits for them to finish. Returns `false`
    /// when sessions were still running after the bounded wait.
    pub async fn shutdown(&mut self) -> bool {
        self.stop();
        let mut attempts = 0;
        while !self.listeners.iter().all(ListenerHandle::is_finished) {
            attempts += 1;
            if attempts > self.poll_attempts {
                let busy: usize = self
                    .listeners
                    .iter()
                    .map(|l| l.context().active_sessions())
                    .sum();
                warn!(sessions = busy, "abandoning sessions still running after shutdown wait");
                self.listeners.clear();
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        for listener in self.listeners.drain(..) {
            let name = listener.name().to_string();
            if let Err(e) = listener.join().await {
                warn!(service = %name, error = %e, "listener ended with an error");
            }
        }
        info!("ICAP server stopped");
        true
    }

    /// Stops every listener, then starts the listeners of `config`.
    pub async fn restart(&mut self, config: &ServerConfig) -> IcapResult<()> {
        info!("restarting ICAP server");
        config.validate()?;
        self.shutdown().await;
        let fresh = Self::start(config).await?;
        self.listeners = fresh.listeners;
        Ok(())
    }
}
