//! Per-target connection pools
//!
//! One pool per target name, created lazily on first use and kept until
//! [`ConnectionManager::close`]. A semaphore with `max_size` permits bounds
//! the number of checked-out connections; the open-connection count is
//! reserved under the pool mutex before any connect attempt, so a pool
//! never holds more than `max_size` sessions even while connecting.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Connection, Connector};
use crate::config::{TargetConfig, MAX_TIMEOUT};
use crate::error::ScrapeError;

/// Attempts made to open a fresh connection before giving up
pub const CONNECT_ATTEMPTS: u32 = 2;

/// `start + timeout` with the timeout capped at [`MAX_TIMEOUT`]
///
/// Never panics; an unrepresentable instant collapses to `start`.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start.checked_add(timeout.min(MAX_TIMEOUT)).unwrap_or(start)
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Open connections, idle or checked out
    pub open: usize,
    /// Connections waiting in the pool
    pub idle: usize,
    /// Configured cap
    pub max_size: usize,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    open: usize,
    closed: bool,
}

struct TargetPool {
    target: TargetConfig,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl TargetPool {
    fn new(target: TargetConfig) -> Self {
        let max_size = target.pool.max_size;
        Self {
            target,
            slots: Arc::new(Semaphore::new(max_size.min(Semaphore::MAX_PERMITS))),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn name(&self) -> &str {
        &self.target.name
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            max_size: self.target.pool.max_size,
        }
    }

    /// Pop the most recently returned connection, closing expired ones
    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        let idle_timeout = self.target.pool.idle_timeout();
        let (taken, expired) = {
            let mut state = self.lock();
            let (fresh, expired): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|entry| entry.since.elapsed() <= idle_timeout);
            state.idle = fresh;
            state.open -= expired.len();
            (state.idle.pop().map(|entry| entry.conn), expired)
        };

        for entry in expired {
            debug!(target = %self.name(), conn_id = entry.conn.id(), "Closing idle connection");
        }
        taken
    }

    /// Reserve room for one more open connection
    fn reserve(&self) -> bool {
        let mut state = self.lock();
        if state.closed || state.open >= self.target.pool.max_size {
            return false;
        }
        state.open += 1;
        true
    }

    /// Account for a destroyed connection
    fn forget(&self) {
        let mut state = self.lock();
        state.open = state.open.saturating_sub(1);
    }

    fn put_back(&self, conn: Box<dyn Connection>) {
        let mut state = self.lock();
        if state.closed {
            state.open = state.open.saturating_sub(1);
            drop(state);
            debug!(target = %self.name(), conn_id = conn.id(), "Pool closed; destroying returned connection");
            return;
        }
        state.idle.push(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    fn close(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open -= drained.len();
            drained
        };
        self.slots.close();
        debug!(target = %self.name(), closed = drained.len(), "Pool closed");
    }

    /// Hand out a connection for an already-granted slot
    async fn checkout(
        self: &Arc<Self>,
        connector: &dyn Connector,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
    ) -> Result<PooledConnection, ScrapeError> {
        if let Some(mut conn) = self.take_idle() {
            match tokio::time::timeout_at(deadline, conn.ping()).await {
                Ok(Ok(())) => {
                    return Ok(PooledConnection::new(conn, Arc::clone(self), permit));
                }
                Ok(Err(e)) => {
                    warn!(target = %self.name(), conn_id = conn.id(), error = %e, "Liveness check failed; discarding connection");
                    self.forget();
                }
                Err(_) => {
                    warn!(target = %self.name(), conn_id = conn.id(), "Liveness check timed out; discarding connection");
                    self.forget();
                }
            }
        }

        let conn = self.open(connector, deadline).await?;
        Ok(PooledConnection::new(conn, Arc::clone(self), permit))
    }

    async fn open(
        &self,
        connector: &dyn Connector,
        deadline: Instant,
    ) -> Result<Box<dyn Connection>, ScrapeError> {
        if !self.reserve() {
            return Err(ScrapeError::PoolExhausted {
                target: self.target.name.clone(),
                waited_ms: 0,
            });
        }

        let mut attempts = 0;
        let mut reason = String::new();
        while attempts < CONNECT_ATTEMPTS {
            attempts += 1;
            match tokio::time::timeout_at(deadline, connector.connect(&self.target)).await {
                Ok(Ok(conn)) => {
                    debug!(target = %self.name(), conn_id = conn.id(), attempt = attempts, "Opened connection");
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    warn!(
                        target = %self.name(),
                        attempt = attempts,
                        max = CONNECT_ATTEMPTS,
                        error = %e,
                        "Connection attempt failed"
                    );
                    reason = e.to_string();
                }
                Err(_) => {
                    reason = "connect timed out".to_string();
                    break;
                }
            }
        }

        self.forget();
        Err(ScrapeError::ConnectFailed {
            target: self.target.name.clone(),
            attempts,
            reason,
        })
    }
}

/// Connection-relevant part of a target; other fields may change freely on reload
fn same_endpoint(a: &TargetConfig, b: &TargetConfig) -> bool {
    a.url == b.url && a.username == b.username && a.password == b.password && a.pool == b.pool
}

/// A connection checked out of a pool
///
/// Dereferences to the underlying [`Connection`]. Give it back with
/// [`ConnectionManager::release`]; dropping it without release destroys the
/// session, so an abandoned scrape can never return a half-used session.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<TargetPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, pool: Arc<TargetPool>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    /// Name of the target this connection belongs to
    pub fn target(&self) -> &str {
        self.pool.name()
    }

    /// Return the connection to its pool, or destroy it when unhealthy
    pub fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            if healthy {
                self.pool.put_back(conn);
            } else {
                debug!(target = %self.pool.name(), conn_id = conn.id(), "Destroying unhealthy connection");
                self.pool.forget();
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("connection is only taken by release or drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("connection is only taken by release or drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(target = %self.pool.name(), conn_id = conn.id(), "Connection dropped without release; destroying");
            self.pool.forget();
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.name())
            .field("conn_id", &self.conn.as_ref().map(|c| c.id()))
            .finish()
    }
}

/// Registry of per-target pools
///
/// Owned by the server state and shared by every scrape; independent
/// targets never contend on anything but the short registry lookup.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    pools: Mutex<HashMap<String, Arc<TargetPool>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager opening sessions with `connector`
    pub fn new(connector: impl Connector) -> Self {
        Self::with_connector(Arc::new(connector))
    }

    /// Create a manager from a shared connector
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, Arc<TargetPool>>> {
        match self.pools.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pool for a target, replacing it when the endpoint changed on reload
    fn pool_for(&self, target: &TargetConfig) -> Arc<TargetPool> {
        let mut pools = self.pools();
        if let Some(pool) = pools.get(&target.name) {
            if same_endpoint(&pool.target, target) {
                return Arc::clone(pool);
            }
            info!(target = %target.name, "Target endpoint changed; recreating pool");
            pool.close();
        }

        let pool = Arc::new(TargetPool::new(target.clone()));
        pools.insert(target.name.clone(), Arc::clone(&pool));
        pool
    }

    fn ensure_open(&self, target: &TargetConfig) -> Result<(), ScrapeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ScrapeError::ConnectFailed {
                target: target.name.clone(),
                attempts: 0,
                reason: "connection manager is closed".to_string(),
            });
        }
        Ok(())
    }

    /// Check out a connection, waiting at most `timeout` for a free slot
    ///
    /// The same budget bounds the liveness check and any connect attempts.
    pub async fn acquire(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<PooledConnection, ScrapeError> {
        self.ensure_open(target)?;
        let pool = self.pool_for(target);
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);

        let permit =
            match tokio::time::timeout_at(deadline, Arc::clone(&pool.slots).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    debug!(target = %target.name, waited_ms, "No connection slot available");
                    return Err(ScrapeError::PoolExhausted {
                        target: target.name.clone(),
                        waited_ms,
                    });
                }
            };

        pool.checkout(self.connector.as_ref(), permit, deadline).await
    }

    /// Check out a connection only if a slot is free right now
    pub async fn try_acquire(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<Option<PooledConnection>, ScrapeError> {
        self.ensure_open(target)?;
        let pool = self.pool_for(target);
        let permit = match Arc::clone(&pool.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok(None),
        };

        pool.checkout(self.connector.as_ref(), permit, deadline_after(Instant::now(), timeout))
            .await
            .map(Some)
    }

    /// Give a connection back; unhealthy connections are destroyed
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// Statistics of every pool, sorted by target name
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<(String, PoolStats)> = self
            .pools()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Close the pools of targets for which `keep` is false
    ///
    /// Used after a reload removed targets. Checked-out connections of a
    /// closed pool are destroyed when released.
    pub fn retain<F>(&self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        let removed: Vec<Arc<TargetPool>> = {
            let mut pools = self.pools();
            let names: Vec<String> = pools.keys().filter(|n| !keep(n.as_str())).cloned().collect();
            names.iter().filter_map(|n| pools.remove(n)).collect()
        };
        for pool in &removed {
            info!(target = %pool.name(), "Target removed; closing pool");
            pool.close();
        }
    }

    /// Close every pool; later acquisitions fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<Arc<TargetPool>> = self.pools().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.close();
        }
        info!(pools = pools.len(), "Connection pools closed");
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pools", &self.pools().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ResultSet;
    use crate::error::ConnectionError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    #[derive(Default)]
    struct Flags {
        connects: AtomicUsize,
        next_id: AtomicU64,
        ping_fails: AtomicBool,
        connect_fails: AtomicBool,
    }

    struct FakeConnector(Arc<Flags>);

    struct FakeConnection {
        id: u64,
        flags: Arc<Flags>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        fn id(&self) -> u64 {
            self.id
        }

        async fn execute(&mut self, _sql: &str) -> Result<ResultSet, ConnectionError> {
            Ok(ResultSet::default())
        }

        async fn ping(&mut self) -> Result<(), ConnectionError> {
            if self.flags.ping_fails.load(Ordering::SeqCst) {
                Err(ConnectionError::Protocol("gone".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _target: &TargetConfig,
        ) -> Result<Box<dyn Connection>, ConnectionError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.connect_fails.load(Ordering::SeqCst) {
                return Err(ConnectionError::Connect("refused".into()));
            }
            Ok(Box::new(FakeConnection {
                id: self.0.next_id.fetch_add(1, Ordering::SeqCst),
                flags: Arc::clone(&self.0),
            }))
        }
    }

    fn setup(max_size: usize) -> (ConnectionManager, Arc<Flags>, TargetConfig) {
        let flags = Arc::new(Flags::default());
        let manager = ConnectionManager::new(FakeConnector(Arc::clone(&flags)));
        let mut target = TargetConfig::new("T1", "http://localhost:8080");
        target.pool.max_size = max_size;
        (manager, flags, target)
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_healthy_release_reuses_connection() {
        let (manager, flags, target) = setup(2);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        let first_id = conn.id();
        manager.release(conn, true);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(flags.connects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.target(), "T1");
    }

    #[tokio::test]
    async fn test_unhealthy_release_destroys_connection() {
        let (manager, flags, target) = setup(2);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        manager.release(conn, false);
        assert_eq!(manager.stats()[0].1.open, 0);

        let _conn = manager.acquire(&target, WAIT).await.unwrap();
        assert_eq!(flags.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_exhausted_after_timeout() {
        let (manager, _flags, target) = setup(1);

        let _held = manager.acquire(&target, WAIT).await.unwrap();
        let err = manager.acquire(&target, WAIT).await.unwrap_err();
        assert!(matches!(err, ScrapeError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let (manager, flags, target) = setup(1);
        let manager = Arc::new(manager);

        let held = manager.acquire(&target, WAIT).await.unwrap();
        let waiter = {
            let manager = Arc::clone(&manager);
            let target = target.clone();
            tokio::spawn(async move { manager.acquire(&target, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        manager.release(held, true);

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id(), 0);
        assert_eq!(flags.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_liveness_check_opens_fresh_connection() {
        let (manager, flags, target) = setup(2);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        manager.release(conn, true);
        flags.ping_fails.store(true, Ordering::SeqCst);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(manager.stats()[0].1.open, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_retried_then_reported() {
        let (manager, flags, target) = setup(2);
        flags.connect_fails.store(true, Ordering::SeqCst);

        let err = manager.acquire(&target, WAIT).await.unwrap_err();
        match err {
            ScrapeError::ConnectFailed { attempts, .. } => assert_eq!(attempts, CONNECT_ATTEMPTS),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(flags.connects.load(Ordering::SeqCst), CONNECT_ATTEMPTS as usize);
        assert_eq!(manager.stats()[0].1.open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_stale_connection() {
        let (manager, flags, mut target) = setup(2);
        target.pool.idle_timeout_ms = 1_000;

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        manager.release(conn, true);
        tokio::time::advance(Duration::from_secs(2)).await;

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(flags.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_without_release_frees_slot() {
        let (manager, _flags, target) = setup(1);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        drop(conn);

        assert_eq!(manager.stats()[0].1.open, 0);
        assert!(manager.acquire(&target, WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_wait() {
        let (manager, _flags, target) = setup(1);

        let _held = manager.acquire(&target, WAIT).await.unwrap();
        let extra = manager.try_acquire(&target, WAIT).await.unwrap();
        assert!(extra.is_none());
    }

    #[tokio::test]
    async fn test_endpoint_change_recreates_pool() {
        let (manager, flags, target) = setup(2);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        manager.release(conn, true);

        let mut moved = target.clone();
        moved.url = "http://elsewhere:8080".to_string();
        let conn = manager.acquire(&moved, WAIT).await.unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(flags.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retain_closes_removed_targets() {
        let (manager, _flags, target) = setup(2);
        let other = TargetConfig::new("T2", "http://localhost:8081");

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        manager.release(conn, true);
        let held = manager.acquire(&other, WAIT).await.unwrap();

        manager.retain(|name| name == "T1");
        let stats = manager.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "T1");

        // Returned into a closed pool: destroyed, not kept
        manager.release(held, true);
        assert_eq!(manager.stats().len(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_new_acquisitions() {
        let (manager, _flags, target) = setup(2);

        let conn = manager.acquire(&target, WAIT).await.unwrap();
        manager.release(conn, true);
        manager.close();

        assert!(manager.stats().is_empty());
        let err = manager.acquire(&target, WAIT).await.unwrap_err();
        assert!(err.is_connection_level());
    }

    #[test]
    fn test_deadline_after_is_capped() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), now + MAX_TIMEOUT);
        assert_eq!(deadline_after(now, WAIT), now + WAIT);
    }

    #[tokio::test]
    async fn test_acquire_with_huge_timeout() {
        let (manager, _flags, target) = setup(1);
        let conn = manager.acquire(&target, Duration::MAX).await.unwrap();
        assert!(manager.try_acquire(&target, Duration::MAX).await.unwrap().is_none());
        manager.release(conn, true);
    }

    #[tokio::test]
    async fn test_unvalidated_pool_size_does_not_panic() {
        let (manager, _flags, target) = setup(usize::MAX);
        let conn = manager.acquire(&target, WAIT).await.unwrap();
        assert_eq!(manager.stats()[0].1.open, 1);
        manager.release(conn, true);
    }
}
