// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend connection pool.
//!
//! One pool per registered server. Borrowing is bounded by a semaphore of
//! `max_connections` permits: a borrower first takes a permit, then reuses
//! an idle connection or opens a new one. A connection is only ever opened
//! by a permit holder when no idle one exists, so the number of open
//! connections never exceeds the bound.
//!
//! A maintenance task per pool walks the idle connections every tick:
//!
//! - idle deadline passed: close it
//! - keep-alive due: send `KRQ`, expect `KRS` within the keep-alive timeout;
//!   on failure close it and report [`PoolEvent::KeepAliveFailed`]
//!
//! Any I/O error or timeout on a borrowed connection destroys it. The pool
//! never retries.

mod connection;

pub use connection::ScmpConnection;

use crate::config::PoolConfig;
use crate::transport::{Connector, Endpoint};
use parking_lot::Mutex;
use scmp::{FrameDecoderError, Message};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool and pooled-connection failures.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("no connection to {endpoint} available within {waited:?}")]
    Exhausted { endpoint: Endpoint, waited: Duration },

    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: Endpoint, reason: String },

    #[error("connection closed by peer")]
    Closed,

    #[error("pool closed")]
    PoolClosed,

    #[error("keep-alive failed: {0}")]
    KeepAlive(String),

    #[error("transport error: {0}")]
    Io(String),
}

impl From<FrameDecoderError> for PoolError {
    fn from(e: FrameDecoderError) -> Self {
        PoolError::Io(e.to_string())
    }
}

/// Notifications from a pool to its owner.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// An idle connection failed its keep-alive probe and was closed.
    KeepAliveFailed {
        pool_id: u64,
        endpoint: Endpoint,
        reason: String,
    },
    /// An idle connection outlived its idle timeout and was closed.
    IdleEvicted { pool_id: u64, connection: u64 },
}

/// Resolved settings for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub borrow_timeout: Duration,
    pub operation_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Duration,
    pub maintenance_tick: Duration,
    pub max_message_size: usize,
    pub large_message_limit: usize,
}

impl PoolSettings {
    pub fn from_config(config: &PoolConfig, max_message_size: usize, large_message_limit: usize) -> Self {
        Self {
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout(),
            borrow_timeout: config.borrow_timeout(),
            operation_timeout: config.operation_timeout(),
            idle_timeout: config.idle_timeout(),
            keep_alive_interval: config.keep_alive_interval(),
            keep_alive_timeout: config.keep_alive_timeout(),
            maintenance_tick: config.maintenance_tick(),
            max_message_size,
            large_message_limit,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(
            &PoolConfig::default(),
            scmp::DEFAULT_MAX_MESSAGE_SIZE,
            scmp::DEFAULT_LARGE_MESSAGE_LIMIT,
        )
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max: usize,
    pub open: usize,
    pub idle: usize,
    pub busy: usize,
}

struct PoolInner {
    id: u64,
    endpoint: Endpoint,
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<ScmpConnection>>,
    open: AtomicUsize,
    next_connection: AtomicU64,
    closed: AtomicBool,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn forget(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded set of connections to one backend endpoint. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        endpoint: Endpoint,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        let max = settings.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                endpoint,
                settings,
                connector,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                open: AtomicUsize::new(0),
                next_connection: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                events,
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let open = self.inner.open.load(Ordering::Acquire);
        let idle = self.inner.idle.lock().len();
        PoolStats {
            max: self.inner.settings.max_connections,
            open,
            idle,
            busy: open.saturating_sub(idle),
        }
    }

    /// Borrow a connection, waiting at most the configured borrow timeout
    /// for a free slot.
    pub async fn borrow(&self) -> Result<PooledConnection, PoolError> {
        self.borrow_timeout(self.inner.settings.borrow_timeout).await
    }

    pub async fn borrow_timeout(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::PoolClosed),
            Err(_) => {
                debug!(endpoint = %self.inner.endpoint, ?timeout, "pool exhausted");
                return Err(PoolError::Exhausted {
                    endpoint: self.inner.endpoint.clone(),
                    waited: timeout,
                });
            }
        };

        let reused = self.inner.idle.lock().pop_back();
        let conn = match reused {
            Some(conn) => conn,
            None => self.open_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    async fn open_connection(&self) -> Result<ScmpConnection, PoolError> {
        let inner = &self.inner;
        let timeout = inner.settings.connect_timeout;
        let stream = match tokio::time::timeout(timeout, inner.connector.connect(&inner.endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(PoolError::Connect {
                    endpoint: inner.endpoint.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PoolError::Timeout {
                    op: "connect",
                    after: timeout,
                })
            }
        };

        let id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
        inner.open.fetch_add(1, Ordering::AcqRel);
        debug!(pool = inner.id, connection = id, endpoint = %inner.endpoint, "connection opened");
        Ok(ScmpConnection::new(
            id,
            inner.endpoint.clone(),
            stream,
            inner.settings.max_message_size,
            inner.settings.large_message_limit,
        ))
    }

    fn return_idle(&self, mut conn: ScmpConnection) {
        let inner = &self.inner;
        if self.is_closed() {
            inner.forget();
            return;
        }
        let now = Instant::now();
        conn.last_used = now;
        conn.idle_deadline = now + inner.settings.idle_timeout;
        conn.next_keep_alive = inner
            .settings
            .keep_alive_interval
            .and_then(|i| now.checked_add(i));
        inner.idle.lock().push_back(conn);
    }

    /// Start the maintenance task. Calling it twice is a no-op.
    pub fn start_maintenance(&self) {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let tick = self.inner.settings.maintenance_tick;
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                pool.maintain().await;
            }
        }));
    }

    /// One maintenance pass over the idle connections.
    pub async fn maintain(&self) {
        let now = Instant::now();
        let inner = &self.inner;

        let expired: Vec<ScmpConnection> = {
            let mut idle = inner.idle.lock();
            let (expired, keep): (Vec<_>, Vec<_>) =
                idle.drain(..).partition(|c| c.idle_deadline <= now);
            idle.extend(keep);
            expired
        };
        for conn in expired {
            inner.forget();
            debug!(pool = inner.id, connection = conn.id(), idle = ?now.duration_since(conn.last_used()), "idle connection evicted");
            inner.emit(PoolEvent::IdleEvicted {
                pool_id: inner.id,
                connection: conn.id(),
            });
            conn.close().await;
        }

        let Some(interval) = inner.settings.keep_alive_interval else {
            return;
        };

        loop {
            // Probing takes a permit like a borrow so the bound still holds.
            let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
                break;
            };
            let due = {
                let mut idle = inner.idle.lock();
                idle.iter()
                    .position(|c| c.next_keep_alive.is_some_and(|t| t <= now))
                    .and_then(|i| idle.remove(i))
            };
            let Some(mut conn) = due else { break };

            match conn.keep_alive(inner.settings.keep_alive_timeout).await {
                Ok(()) => {
                    conn.next_keep_alive = Instant::now().checked_add(interval);
                    if self.is_closed() {
                        inner.forget();
                    } else {
                        inner.idle.lock().push_back(conn);
                    }
                }
                Err(e) => {
                    inner.forget();
                    warn!(pool = inner.id, connection = conn.id(), endpoint = %inner.endpoint, error = %e, "keep-alive failed");
                    inner.emit(PoolEvent::KeepAliveFailed {
                        pool_id: inner.id,
                        endpoint: inner.endpoint.clone(),
                        reason: e.to_string(),
                    });
                    conn.close().await;
                }
            }
            drop(permit);
        }
    }

    /// Close the pool: refuse new borrows, close idle connections and stop
    /// maintenance. Borrowed connections are discarded when dropped.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        let idle: Vec<ScmpConnection> = self.inner.idle.lock().drain(..).collect();
        for conn in idle {
            self.inner.forget();
            conn.close().await;
        }
        info!(pool = self.inner.id, endpoint = %self.inner.endpoint, "pool closed");
    }
}

/// A borrowed connection. Call [`PooledConnection::release`] to hand it back;
/// dropping it instead discards the connection, since its stream state is
/// unknown.
pub struct PooledConnection {
    conn: Option<ScmpConnection>,
    pool: ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(ScmpConnection::id)
    }

    fn live(&mut self) -> Result<&mut ScmpConnection, PoolError> {
        self.conn.as_mut().ok_or(PoolError::Closed)
    }

    fn discard(&mut self, err: &PoolError) {
        if let Some(conn) = self.conn.take() {
            self.pool.inner.forget();
            debug!(pool = self.pool.id(), connection = conn.id(), error = %err, "connection destroyed");
        }
    }

    pub async fn send(&mut self, msg: &Message, timeout: Duration) -> Result<(), PoolError> {
        let result = self.live()?.send(msg, timeout).await;
        if let Err(e) = &result {
            self.discard(e);
        }
        result
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<Message, PoolError> {
        let result = self.live()?.receive(timeout).await;
        if let Err(e) = &result {
            self.discard(e);
        }
        result
    }

    /// Send and wait for the reply within `timeout`.
    pub async fn request(&mut self, msg: &Message, timeout: Duration) -> Result<Message, PoolError> {
        let result = self.live()?.request(msg, timeout).await;
        if let Err(e) = &result {
            self.discard(e);
        }
        result
    }

    /// Mark idle and restart its idle timer.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_idle(conn);
        }
    }

    /// Close the connection instead of returning it.
    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.inner.forget();
            conn.close().await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.inner.forget();
            debug!(pool = self.pool.id(), connection = conn.id(), "borrowed connection dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use scmp::{FrameReader, FrameWriter, MessageType};

    fn settings() -> PoolSettings {
        PoolSettings {
            max_connections: 2,
            borrow_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(60),
            keep_alive_interval: None,
            ..PoolSettings::default()
        }
    }

    /// Echo backend: answers requests with an empty reply, KRQ with KRS.
    fn backend(connector: &MemoryConnector, endpoint: Endpoint) -> Arc<AtomicUsize> {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let mut listener = connector.listen(endpoint);
        tokio::spawn(async move {
            while let Some(stream) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (r, w) = tokio::io::split(stream);
                    let mut reader = FrameReader::new(r, 1 << 20);
                    let mut writer = FrameWriter::new(w, 1 << 16);
                    while let Ok(Some(msg)) = reader.read_message().await {
                        let reply = if msg.keep_alive {
                            Message::keep_alive_response()
                        } else {
                            Message::reply_to(&msg)
                        };
                        if writer.write_message(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        accepted
    }

    #[tokio::test]
    async fn test_borrow_reuses_released_connection() {
        let connector = Arc::new(MemoryConnector::new());
        let ep = Endpoint::new("b", 1);
        let accepted = backend(&connector, ep.clone());
        let pool = ConnectionPool::new(ep, settings(), connector, None);

        let mut conn = pool.borrow().await.unwrap();
        let req = Message::request(MessageType::SrvEcho).with_header(scmp::HeaderKey::MessageId, "1");
        let reply = conn.request(&req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.message_id(), Some("1"));
        conn.release();

        let conn = pool.borrow().await.unwrap();
        conn.release();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats(), PoolStats { max: 2, open: 1, idle: 1, busy: 0 });
    }

    #[tokio::test]
    async fn test_exhausted_when_all_borrowed() {
        let connector = Arc::new(MemoryConnector::new());
        let ep = Endpoint::new("b", 2);
        backend(&connector, ep.clone());
        let pool = ConnectionPool::new(ep, settings(), connector, None);

        let a = pool.borrow().await.unwrap();
        let _b = pool.borrow().await.unwrap();
        assert_eq!(pool.stats().open, 2);
        assert!(matches!(pool.borrow().await, Err(PoolError::Exhausted { .. })));

        drop(a);
        assert_eq!(pool.stats().open, 1);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(Endpoint::new("nobody", 1), settings(), connector, None);
        assert!(matches!(pool.borrow().await, Err(PoolError::Connect { .. })));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_io_error_destroys_connection() {
        let connector = Arc::new(MemoryConnector::new());
        let ep = Endpoint::new("mute", 1);
        let mut listener = connector.listen(ep.clone());
        let pool = ConnectionPool::new(ep, settings(), connector, None);

        let mut conn = pool.borrow().await.unwrap();
        let remote = listener.accept().await.unwrap();
        drop(remote);

        let req = Message::request(MessageType::SrvData);
        assert!(conn.request(&req, Duration::from_millis(200)).await.is_err());
        assert_eq!(conn.id(), None);
        conn.release();
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_maintenance_evicts_idle() {
        let connector = Arc::new(MemoryConnector::new());
        let ep = Endpoint::new("b", 3);
        backend(&connector, ep.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            ep,
            PoolSettings {
                idle_timeout: Duration::from_millis(10),
                ..settings()
            },
            connector,
            Some(tx),
        );

        pool.borrow().await.unwrap().release();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.maintain().await;

        assert_eq!(pool.stats().open, 0);
        assert!(matches!(rx.recv().await, Some(PoolEvent::IdleEvicted { .. })));
    }

    #[tokio::test]
    async fn test_keep_alive_probe_keeps_healthy_connection() {
        let connector = Arc::new(MemoryConnector::new());
        let ep = Endpoint::new("b", 4);
        backend(&connector, ep.clone());
        let pool = ConnectionPool::new(
            ep,
            PoolSettings {
                keep_alive_interval: Some(Duration::from_millis(5)),
                keep_alive_timeout: Duration::from_millis(200),
                ..settings()
            },
            connector,
            None,
        );

        pool.borrow().await.unwrap().release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.maintain().await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_close_refuses_borrow() {
        let connector = Arc::new(MemoryConnector::new());
        let ep = Endpoint::new("b", 5);
        backend(&connector, ep.clone());
        let pool = ConnectionPool::new(ep, settings(), connector, None);
        pool.borrow().await.unwrap().release();

        pool.close().await;
        assert_eq!(pool.stats().open, 0);
        assert!(matches!(pool.borrow().await, Err(PoolError::PoolClosed)));
    }
}
