// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{select_transport, McpError, Result, Transport};

/// Connections initialised per server.
pub const POOL_SIZE: usize = 5;
/// How long `acquire` blocks for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeat probe interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One pooled connection with its transport.
pub struct PooledConnection {
    pub id: usize,
    pub transport: Box<dyn Transport>,
}

/// Fixed-size connection pool for one server.
///
/// `acquire` hands out an idle connection or parks the caller in a FIFO of
/// waiters; `release` hands the connection to the oldest waiter, else back
/// to the idle list.  Closed connections are replaced best-effort.
pub struct ConnectionPool {
    server: String,
    auth: Option<String>,
    available: StdMutex<Vec<Arc<PooledConnection>>>,
    waiting: StdMutex<VecDeque<oneshot::Sender<Arc<PooledConnection>>>>,
    next_conn_id: AtomicUsize,
    acquire_timeout: StdMutex<Duration>,
}

impl ConnectionPool {
    /// Connect up to `capacity` transports in parallel.  Individual
    /// connection failures shrink the pool rather than failing it; an
    /// entirely unreachable server yields an empty pool whose first
    /// `acquire` times out.
    pub async fn initialize(
        server: impl Into<String>,
        auth: Option<String>,
        capacity: usize,
    ) -> Arc<Self> {
        let server = server.into();
        let pool = Arc::new(Self {
            server: server.clone(),
            auth: auth.clone(),
            available: StdMutex::new(Vec::new()),
            waiting: StdMutex::new(VecDeque::new()),
            next_conn_id: AtomicUsize::new(0),
            acquire_timeout: StdMutex::new(ACQUIRE_TIMEOUT),
        });

        let attempts = (0..capacity).map(|_| select_transport(&server, auth.clone()));
        for outcome in futures::future::join_all(attempts).await {
            match outcome {
                Ok(transport) => {
                    let id = pool.next_conn_id.fetch_add(1, Ordering::SeqCst);
                    pool.available
                        .lock()
                        .unwrap()
                        .push(Arc::new(PooledConnection { id, transport }));
                }
                Err(e) => warn!(server = %server, error = %e, "pool connection failed"),
            }
        }
        debug!(server = %server, size = pool.available_count(), "pool initialised");
        pool
    }

    /// Test hook: shrink the acquire window so starvation paths run fast.
    #[cfg(test)]
    pub(crate) fn set_acquire_timeout(&self, timeout: Duration) {
        *self.acquire_timeout.lock().unwrap() = timeout;
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    /// Take an idle connection, or wait (FIFO) until one is released.
    pub async fn acquire(&self) -> Result<Arc<PooledConnection>> {
        if let Some(conn) = self.available.lock().unwrap().pop() {
            return Ok(conn);
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().unwrap().push_back(tx);
        let window = *self.acquire_timeout.lock().unwrap();
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(McpError::AcquireTimeout),
            Err(_) => Err(McpError::AcquireTimeout),
        }
    }

    /// Return a connection: the oldest live waiter gets it, otherwise it
    /// goes back to the idle list.
    pub fn release(&self, conn: Arc<PooledConnection>) {
        let mut conn = conn;
        loop {
            let waiter = self.waiting.lock().unwrap().pop_front();
            match waiter {
                Some(tx) => match tx.send(conn) {
                    Ok(()) => return,
                    // Waiter gave up (timeout); try the next one.
                    Err(returned) => conn = returned,
                },
                None => {
                    self.available.lock().unwrap().push(conn);
                    return;
                }
            }
        }
    }

    /// Drop a closed connection and try to create a replacement.
    pub async fn replace_closed(&self, conn_id: usize) {
        self.available.lock().unwrap().retain(|c| c.id != conn_id);
        match select_transport(&self.server, self.auth.clone()).await {
            Ok(transport) => {
                let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
                debug!(server = %self.server, id, "replacement connection created");
                self.release(Arc::new(PooledConnection { id, transport }));
            }
            Err(e) => warn!(server = %self.server, error = %e, "replacement connection failed"),
        }
    }

    /// Periodic health probe over the idle connections.  A failed ping drops
    /// the connection and schedules a replacement.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                ticker.tick().await;
                let idle: Vec<Arc<PooledConnection>> =
                    pool.available.lock().unwrap().iter().cloned().collect();
                for conn in idle {
                    if let Err(e) = conn.transport.ping().await {
                        warn!(server = %pool.server, conn = conn.id, error = %e, "heartbeat failed");
                        pool.replace_closed(conn.id).await;
                    }
                }
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
