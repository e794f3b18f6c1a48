//! ICAP listeners.
//!
//! A [`Listener`] binds one TCP socket for one configured service and
//! dispatches accepted connections in one of two modes:
//!
//! - **keep-alive**: every connection gets a fresh [`Session`] task that
//!   serves exchanges until the client leaves;
//! - **pooled**: connections go to a [`ConnectionPool`] of `pool_size`
//!   sessions, extra connections wait in FIFO order, and each connection is
//!   closed after one exchange.
//!
//! The OPTIONS response and the `204` response are rendered once when the
//! listener is built.
//!
//! ```rust,no_run
//! use icap_engine::config::ListenerConfig;
//! use icap_engine::error::IcapResult;
//! use icap_engine::server::Listener;
//!
//! #[tokio::main]
//! async fn main() -> IcapResult<()> {
//!     let config = ListenerConfig::new("echo").with_port(1344).with_keep_alive(true);
//!     let listener = Listener::builder(config).build().await?;
//!     listener.run().await
//! }
//! ```
//!
//! Several listeners are driven together by
//! [`IcapServer`](supervisor::IcapServer).

pub mod options;
pub mod supervisor;

use crate::config::ListenerConfig;
use crate::context::ListenerContext;
use crate::error::{Error, IcapResult};
use crate::pool::{ConnectionPool, PoolStats};
use crate::service::AdaptationService;
use crate::services;
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub use crate::server::options::ServiceOptions;
pub use crate::server::supervisor::IcapServer;

/// Consecutive accept failures tolerated before a listener gives up.
pub const MAX_ACCEPT_FAILURES: u32 = 3;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type TcpPool = ConnectionPool<(TcpStream, SocketAddr)>;

/// Consecutive accept failures of one listener.
#[derive(Debug, Default)]
struct AcceptFailures(u32);

impl AcceptFailures {
    /// Counts one more failure. `true` once the listener has to give up.
    fn record(&mut self) -> bool {
        self.0 += 1;
        self.0 >= MAX_ACCEPT_FAILURES
    }

    fn reset(&mut self) {
        self.0 = 0;
    }

    fn count(&self) -> u32 {
        self.0
    }
}

/// Builder for [`Listener`].
pub struct ListenerBuilder {
    config: ListenerConfig,
    service: Option<Arc<dyn AdaptationService>>,
}

impl ListenerBuilder {
    /// Uses `service` instead of the bundled handler named by the
    /// configuration.
    pub fn service(mut self, service: Arc<dyn AdaptationService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Validates the configuration and binds the listening socket.
    pub async fn build(self) -> IcapResult<Listener> {
        let service = match self.service {
            Some(service) => {
                self.config.validate_settings()?;
                service
            }
            None => {
                self.config.validate()?;
                services::build(&self.config.handler)?
            }
        };

        let addr = self.config.address();
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::configuration(format!("invalid bind address {addr}: {e}")))?;
        let listener = bind(sock_addr, self.config.effective_backlog())
            .map_err(|source| Error::Bind { addr: addr.clone(), source })?;
        let local_addr = listener.local_addr()?;

        info!(
            service = %self.config.name,
            addr = %local_addr,
            keep_alive = self.config.keep_alive,
            handler = service.name(),
            "ICAP listener bound"
        );
        let ctx = Arc::new(ListenerContext::new(self.config, service, local_addr));
        Ok(Listener { listener, ctx })
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog.max(1))
}

/// A bound ICAP listener.
pub struct Listener {
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
}

impl Listener {
    pub fn builder(config: ListenerConfig) -> ListenerBuilder {
        ListenerBuilder {
            config,
            service: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr()
    }

    pub fn context(&self) -> &Arc<ListenerContext> {
        &self.ctx
    }

    /// Runs the accept loop on the current task until the listener is
    /// stopped or accepting fails repeatedly.
    pub async fn run(self) -> IcapResult<()> {
        let pool = self.make_pool();
        self.accept_loop(pool).await
    }

    /// Runs the accept loop on its own task.
    pub fn spawn(self) -> ListenerHandle {
        let pool = self.make_pool();
        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(self.accept_loop(pool.clone()));
        ListenerHandle { ctx, pool, task }
    }

    fn make_pool(&self) -> Option<Arc<TcpPool>> {
        if self.ctx.keep_alive() {
            return None;
        }
        let ctx = Arc::clone(&self.ctx);
        Some(Arc::new(ConnectionPool::new(
            self.ctx.name(),
            self.ctx.config().effective_pool_size(),
            move |id| Session::new(id, Arc::clone(&ctx)),
        )))
    }

    async fn accept_loop(self, pool: Option<Arc<TcpPool>>) -> IcapResult<()> {
        let name = self.ctx.name().to_string();
        let mut next_session = 0usize;
        let mut failures = AcceptFailures::default();

        let result = loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.ctx.stopped() => break Ok(()),
            };

            let (stream, peer) = match accepted {
                Ok(conn) => {
                    failures.reset();
                    conn
                }
                Err(e) => {
                    if failures.record() {
                        error!(service = %name, error = %e, failures = failures.count(), "accept keeps failing, stopping listener");
                        break Err(Error::Network(e));
                    }
                    warn!(service = %name, error = %e, failures = failures.count(), "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            trace!(service = %name, client = %peer, "connection accepted");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(client = %peer, error = %e, "cannot set TCP_NODELAY");
            }

            match &pool {
                Some(pool) => {
                    if !pool.assign((stream, peer)) {
                        debug!(service = %name, client = %peer, "pool disabled, connection dropped");
                    }
                }
                None => {
                    let mut session = Session::new(next_session, Arc::clone(&self.ctx));
                    next_session = next_session.wrapping_add(1);
                    tokio::spawn(async move { session.serve(stream, Some(peer)).await });
                }
            }
        };

        if let Some(pool) = &pool {
            pool.disable();
        }
        info!(service = %name, "ICAP listener stopped");
        result
    }
}

/// Control handle of a spawned [`Listener`].
pub struct ListenerHandle {
    ctx: Arc<ListenerContext>,
    pool: Option<Arc<TcpPool>>,
    task: JoinHandle<IcapResult<()>>,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr()
    }

    pub fn context(&self) -> &Arc<ListenerContext> {
        &self.ctx
    }

    /// Occupancy of the pool, `None` in keep-alive mode.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(|pool| pool.stats())
    }

    /// Stops accepting, drops queued connections and lets idle sessions
    /// close. Exchanges in flight run to completion.
    pub fn stop(&self) {
        self.ctx.stop();
        if let Some(pool) = &self.pool {
            pool.disable();
        }
    }

    /// `true` once the accept loop and every session of this listener have
    /// finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
            && self.ctx.active_sessions() == 0
            && self.pool.as_ref().is_none_or(|pool| pool.is_finished())
    }

    /// Waits for the accept loop to end and returns its outcome.
    pub async fn join(self) -> IcapResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::service(format!("listener task failed: {e}"))),
        }
    }
}
