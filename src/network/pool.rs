// Connection pooling
//
// Two layers: RouterPool does round-robin over ConnectionManagers for
// redundancy and broadcast, and ConnectionPool is the generic bounded pool
// (min/max size, lifetime and idle expiry, validation, maintenance loop)
// used for downstream resources.

use crate::error::{GatewayError, Result};
use crate::network::connection::ConnectionManager;
use crate::network::lpc::LpcValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Round-robin pool of router connection managers
pub struct RouterPool {
    max_connections: usize,
    connections: Mutex<Vec<Arc<ConnectionManager>>>,
    next_index: AtomicUsize,
}

impl RouterPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connections: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Add a manager and start its connection; false when the pool is full
    pub async fn add_connection(&self, manager: Arc<ConnectionManager>) -> bool {
        {
            let mut connections = self.connections.lock();
            if connections.len() >= self.max_connections {
                return false;
            }
            connections.push(Arc::clone(&manager));
        }
        manager.connect().await;
        true
    }

    pub async fn remove_connection(&self, manager: &Arc<ConnectionManager>) {
        let removed = {
            let mut connections = self.connections.lock();
            let before = connections.len();
            connections.retain(|m| !Arc::ptr_eq(m, manager));
            before != connections.len()
        };
        if removed {
            manager.disconnect().await;
        }
    }

    /// Next currently-connected manager, round robin; None when all are down
    pub fn get_connection(&self) -> Option<Arc<ConnectionManager>> {
        let connections = self.connections.lock();
        if connections.is_empty() {
            return None;
        }
        for _ in 0..connections.len() {
            let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % connections.len();
            let manager = &connections[idx];
            if manager.is_connected() {
                return Some(Arc::clone(manager));
            }
        }
        None
    }

    /// Send to every connected manager; returns the success count
    pub async fn broadcast(&self, value: &LpcValue) -> usize {
        let managers: Vec<_> = self.connections.lock().clone();
        let mut count = 0;
        for manager in managers {
            if manager.send_message(value).await {
                count += 1;
            }
        }
        count
    }

    pub async fn close_all(&self) {
        let managers: Vec<_> = std::mem::take(&mut *self.connections.lock());
        for manager in managers {
            manager.disconnect().await;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

/// Factory and lifecycle hooks for generic pooled connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> Result<Self::Connection>;

    /// Health-check a connection before it is handed out
    async fn validate(&self, _conn: &mut Self::Connection) -> bool {
        true
    }

    /// Return a connection to a clean state before reuse
    async fn reset(&self, _conn: &mut Self::Connection) {}

    async fn close(&self, _conn: Self::Connection) {}
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Connections older than this are retired by maintenance
    pub max_lifetime: Option<Duration>,
    /// Idle connections unused for this long are retired
    pub max_idle_time: Option<Duration>,
    pub acquire_timeout: Duration,
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_lifetime: Some(Duration::from_secs(3600)),
            max_idle_time: Some(Duration::from_secs(300)),
            acquire_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub created: u64,
    pub closed: u64,
    pub acquired: u64,
    pub released: u64,
    pub acquire_timeouts: u64,
    pub validation_failures: u64,
}

struct PooledEntry<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl<C> PooledEntry<C> {
    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime
            .map(|max| self.created_at.elapsed() >= max)
            .unwrap_or(false)
    }

    fn is_idle_expired(&self, max_idle: Option<Duration>) -> bool {
        max_idle
            .map(|max| self.last_used.elapsed() >= max)
            .unwrap_or(false)
    }
}

/// Generic bounded connection pool with background maintenance
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledEntry<F::Connection>>>,
    total: AtomicUsize,
    released: Notify,
    stats: Mutex<PoolStats>,
    closing: AtomicBool,
    maintenance_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            released: Notify::new(),
            stats: Mutex::new(PoolStats::default()),
            closing: AtomicBool::new(false),
            maintenance_task: Mutex::new(None),
        }
    }

    /// Pre-fill to the minimum size and start the maintenance loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_min_connections().await;

        let pool = Arc::clone(self);
        let interval = self.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if pool.closing.load(Ordering::SeqCst) {
                    break;
                }
                pool.run_maintenance().await;
            }
        });
        *self.maintenance_task.lock() = Some(handle);
        Ok(())
    }

    async fn ensure_min_connections(&self) {
        while self.total.load(Ordering::SeqCst) < self.config.min_size {
            self.total.fetch_add(1, Ordering::SeqCst);
            match self.factory.create().await {
                Ok(conn) => {
                    self.stats.lock().created += 1;
                    self.idle.lock().push_back(PooledEntry {
                        conn,
                        created_at: Instant::now(),
                        last_used: Instant::now(),
                        use_count: 0,
                    });
                }
                Err(e) => {
                    self.total.fetch_sub(1, Ordering::SeqCst);
                    warn!(error = %e, "failed to create pooled connection");
                    break;
                }
            }
        }
    }

    /// Retire expired and idle-expired entries, then refill to the minimum
    pub async fn run_maintenance(&self) {
        let retired: Vec<PooledEntry<F::Connection>> = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut retired = Vec::new();
            while let Some(entry) = idle.pop_front() {
                if entry.is_expired(self.config.max_lifetime)
                    || entry.is_idle_expired(self.config.max_idle_time)
                {
                    retired.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
            retired
        };

        for entry in retired {
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.stats.lock().closed += 1;
            self.factory.close(entry.conn).await;
        }

        self.ensure_min_connections().await;
    }

    /// Acquire a connection, waiting up to the configured timeout.
    ///
    /// Returned connections have been validated and reset; dropping the
    /// guard returns the connection to the pool.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard<F>> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(GatewayError::Pool("pool is closed".to_string()));
            }

            // Reuse an idle connection when one passes validation
            let candidate = self.idle.lock().pop_front();
            if let Some(mut entry) = candidate {
                if self.factory.validate(&mut entry.conn).await {
                    self.factory.reset(&mut entry.conn).await;
                    entry.last_used = Instant::now();
                    entry.use_count += 1;
                    self.stats.lock().acquired += 1;
                    return Ok(PoolGuard {
                        pool: Arc::clone(self),
                        entry: Some(entry),
                    });
                }
                self.total.fetch_sub(1, Ordering::SeqCst);
                {
                    let mut stats = self.stats.lock();
                    stats.validation_failures += 1;
                    stats.closed += 1;
                }
                self.factory.close(entry.conn).await;
                continue;
            }

            // Room to grow: create a fresh connection
            if self.total.fetch_add(1, Ordering::SeqCst) < self.config.max_size {
                match self.factory.create().await {
                    Ok(conn) => {
                        {
                            let mut stats = self.stats.lock();
                            stats.created += 1;
                            stats.acquired += 1;
                        }
                        return Ok(PoolGuard {
                            pool: Arc::clone(self),
                            entry: Some(PooledEntry {
                                conn,
                                created_at: Instant::now(),
                                last_used: Instant::now(),
                                use_count: 1,
                            }),
                        });
                    }
                    Err(e) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
            self.total.fetch_sub(1, Ordering::SeqCst);

            // At capacity: wait for a release
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.stats.lock().acquire_timeouts += 1;
                return Err(GatewayError::Timeout(
                    "timed out acquiring pooled connection".to_string(),
                ));
            }
            let _ = tokio::time::timeout(remaining, self.released.notified()).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Close every connection and stop maintenance
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.maintenance_task.lock().take() {
            handle.abort();
        }

        let drained: Vec<PooledEntry<F::Connection>> =
            { self.idle.lock().drain(..).collect() };
        for entry in drained {
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.stats.lock().closed += 1;
            self.factory.close(entry.conn).await;
        }
        debug!("connection pool closed");
    }
}

/// RAII guard over a pooled connection; returns it on drop
pub struct PoolGuard<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    entry: Option<PooledEntry<F::Connection>>,
}

impl<F: ConnectionFactory> PoolGuard<F> {
    pub fn connection(&mut self) -> &mut F::Connection {
        &mut self.entry.as_mut().expect("guard holds connection").conn
    }

    pub fn use_count(&self) -> u64 {
        self.entry.as_ref().map(|e| e.use_count).unwrap_or(0)
    }
}

impl<F: ConnectionFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.last_used = Instant::now();
            self.pool.stats.lock().released += 1;
            self.pool.idle.lock().push_back(entry);
            self.pool.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestFactory {
        counter: AtomicUsize,
        fail_validation: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                counter: AtomicUsize::new(0),
                fail_validation: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        type Connection = usize;

        async fn create(&self) -> Result<usize> {
            Ok(self.counter.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _conn: &mut usize) -> bool {
            !self.fail_validation.load(Ordering::SeqCst)
        }
    }

    fn small_pool_config() -> PoolConfig {
        PoolConfig {
            min_size: 1,
            max_size: 2,
            max_lifetime: None,
            max_idle_time: None,
            acquire_timeout: Duration::from_millis(100),
            maintenance_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_pool_starts_at_min_size() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_pool_config()));
        pool.start().await.unwrap();
        assert_eq!(pool.total_count(), 1);
        assert_eq!(pool.idle_count(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_connection() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_pool_config()));
        pool.start().await.unwrap();

        let id = {
            let mut guard = pool.acquire().await.unwrap();
            *guard.connection()
        };
        let mut guard = pool.acquire().await.unwrap();
        assert_eq!(*guard.connection(), id);
        assert_eq!(pool.stats().created, 1);
        drop(guard);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_capacity() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_pool_config()));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_pool_config()));
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_g| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(a);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_validation_failure_recreates() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_pool_config()));
        pool.start().await.unwrap();

        pool.factory.fail_validation.store(true, Ordering::SeqCst);
        // The idle connection fails validation and a fresh one is created
        let mut guard = pool.acquire().await.unwrap();
        assert_eq!(*guard.connection(), 1);
        assert_eq!(pool.stats().validation_failures, 1);
        drop(guard);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_maintenance_retires_expired() {
        let factory = TestFactory::new();
        let config = PoolConfig {
            min_size: 0,
            max_size: 4,
            max_lifetime: Some(Duration::from_millis(1)),
            max_idle_time: None,
            acquire_timeout: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(3600),
        };
        let pool = Arc::new(ConnectionPool::new(factory, config));
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.run_maintenance().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_router_pool_capacity() {
        use crate::network::connection::{ConnectionConfig, RouterInfo};

        let pool = RouterPool::new(1);
        let first = Arc::new(ConnectionManager::new(
            vec![RouterInfo::new("a", "127.0.0.1", 1, 0)],
            ConnectionConfig {
                connection_timeout: Duration::from_millis(50),
                ..ConnectionConfig::default()
            },
        ));
        let second = Arc::new(ConnectionManager::new(
            vec![RouterInfo::new("b", "127.0.0.1", 1, 0)],
            ConnectionConfig::default(),
        ));

        assert!(pool.add_connection(Arc::clone(&first)).await);
        assert!(!pool.add_connection(second).await);
        assert_eq!(pool.len(), 1);

        // Nothing actually connected, so round-robin finds no manager
        assert!(pool.get_connection().is_none());
        pool.close_all().await;
    }
}
