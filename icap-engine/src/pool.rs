//! Bounded connection pool.
//!
//! A fixed set of worker tasks, each owning one long-lived handler (a
//! [`Session`](crate::session::Session) for ICAP listeners). Connections are
//! handed to idle workers over a single-slot channel; when every worker is
//! busy they wait in a FIFO queue. A worker that finishes a connection takes
//! the oldest queued one directly, without going back to the idle set.
//!
//! The idle set and the pending queue are guarded by one mutex. Each
//! connection runs on its own task so that a handler panic only loses that
//! connection; the worker builds a fresh handler and keeps serving.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Serves one connection at a time on behalf of a pool worker.
#[async_trait]
pub trait ConnectionHandler<T>: Send + 'static {
    async fn handle(&mut self, conn: T);
}

enum Job<T> {
    Serve(T),
    Stop,
}

type MakeHandler<H> = Arc<dyn Fn(usize) -> H + Send + Sync>;

struct IdleWorker<T> {
    id: usize,
    tx: mpsc::Sender<Job<T>>,
}

struct Shared<T> {
    idle: VecDeque<IdleWorker<T>>,
    pending: VecDeque<T>,
    disabled: bool,
}

/// Snapshot of the pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub pending: usize,
}

impl PoolStats {
    pub fn busy(&self) -> usize {
        self.size - self.idle
    }
}

pub struct ConnectionPool<T> {
    name: String,
    size: usize,
    shared: Arc<Mutex<Shared<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> ConnectionPool<T> {
    /// Starts `size` workers; `make_handler` builds the handler of each one
    /// from its worker id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<H, F>(name: &str, size: usize, make_handler: F) -> Self
    where
        T: Send + 'static,
        H: ConnectionHandler<T>,
        F: Fn(usize) -> H + Send + Sync + 'static,
    {
        let make_handler: MakeHandler<H> = Arc::new(make_handler);
        let shared = Arc::new(Mutex::new(Shared {
            idle: VecDeque::with_capacity(size),
            pending: VecDeque::new(),
            disabled: false,
        }));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let (tx, rx) = mpsc::channel(1);
            shared.lock().idle.push_back(IdleWorker { id, tx: tx.clone() });
            let worker = Worker {
                id,
                handler: Some(make_handler(id)),
                make_handler: Arc::clone(&make_handler),
                rx,
                tx,
                shared: Arc::clone(&shared),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        debug!(pool = %name, size, "connection pool started");

        Self {
            name: name.to_string(),
            size,
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        let shared = self.shared.lock();
        PoolStats {
            size: self.size,
            idle: shared.idle.len(),
            pending: shared.pending.len(),
        }
    }

    /// Gives `conn` to an idle worker, or queues it behind the connections
    /// already waiting. Returns `false` (and drops `conn`) once the pool is
    /// disabled.
    pub fn assign(&self, conn: T) -> bool {
        let mut shared = self.shared.lock();
        if shared.disabled {
            return false;
        }

        let mut conn = conn;
        while let Some(worker) = shared.idle.pop_front() {
            match worker.tx.try_send(Job::Serve(conn)) {
                Ok(()) => {
                    trace!(pool = %self.name, worker = worker.id, "connection assigned");
                    return true;
                }
                Err(mpsc::error::TrySendError::Full(Job::Serve(back)))
                | Err(mpsc::error::TrySendError::Closed(Job::Serve(back))) => {
                    debug!(pool = %self.name, worker = worker.id, "dropping unusable worker");
                    conn = back;
                }
                Err(_) => return false,
            }
        }

        shared.pending.push_back(conn);
        trace!(pool = %self.name, pending = shared.pending.len(), "connection queued");
        true
    }

    /// Stops idle workers and drops every queued connection. Busy workers
    /// finish their current connection, then exit.
    pub fn disable(&self) {
        let (idle, pending) = {
            let mut shared = self.shared.lock();
            if shared.disabled {
                return;
            }
            shared.disabled = true;
            (
                std::mem::take(&mut shared.idle),
                std::mem::take(&mut shared.pending),
            )
        };
        for worker in &idle {
            let _ = worker.tx.try_send(Job::Stop);
        }
        debug!(
            pool = %self.name,
            idle = idle.len(),
            dropped = pending.len(),
            "connection pool disabled"
        );
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.lock().disabled
    }

    /// `true` once every worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.workers.lock().iter().all(JoinHandle::is_finished)
    }
}

impl<T> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        self.disable();
    }
}

struct Worker<T, H> {
    id: usize,
    handler: Option<H>,
    make_handler: MakeHandler<H>,
    rx: mpsc::Receiver<Job<T>>,
    tx: mpsc::Sender<Job<T>>,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T, H> Worker<T, H>
where
    T: Send + 'static,
    H: ConnectionHandler<T>,
{
    async fn run(mut self) {
        while let Some(Job::Serve(conn)) = self.rx.recv().await {
            let mut next = Some(conn);
            while let Some(conn) = next.take() {
                self.serve(conn).await;
                next = self.restore();
            }
            if self.shared.lock().disabled {
                break;
            }
        }
        trace!(worker = self.id, "pool worker stopped");
    }

    async fn serve(&mut self, conn: T) {
        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => (self.make_handler)(self.id),
        };
        let task = tokio::spawn(async move {
            handler.handle(conn).await;
            handler
        });
        match task.await {
            Ok(handler) => self.handler = Some(handler),
            Err(e) => warn!(worker = self.id, error = %e, "connection handler failed, replacing it"),
        }
    }

    /// Takes the oldest pending connection, or re-enters the idle set.
    fn restore(&self) -> Option<T> {
        let mut shared = self.shared.lock();
        if shared.disabled {
            return None;
        }
        if let Some(conn) = shared.pending.pop_front() {
            return Some(conn);
        }
        shared.idle.push_back(IdleWorker {
            id: self.id,
            tx: self.tx.clone(),
        });
        None
    }
}
