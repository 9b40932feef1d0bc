// Graceful shutdown
//
// Four ordered phases: drain downstream connections, close what remains,
// run registered cleanup tasks, terminate. Each phase is bounded by its own
// timeout and a force timer ends the process non-zero if the whole sequence
// overstays its welcome.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Closing,
    Cleanup,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub drain_timeout: Duration,
    pub close_timeout: Duration,
    pub cleanup_timeout: Duration,
    /// Hard ceiling on the whole shutdown; expiry exits the process with 1
    pub force_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(5),
            force_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownStats {
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub connections_at_start: usize,
    pub connections_remaining_after_drain: usize,
    pub connections_closed: usize,
    pub cleanup_tasks_completed: usize,
    pub cleanup_tasks_failed: usize,
    pub forced: bool,
}

type CloseFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type CleanupFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Coordinates the phased shutdown of the whole gateway
pub struct GracefulShutdown {
    config: ShutdownConfig,
    phase: Mutex<ShutdownPhase>,
    stats: Mutex<ShutdownStats>,
    connections: Mutex<HashMap<u64, CloseFn>>,
    next_connection_id: AtomicU64,
    cleanup_tasks: Mutex<Vec<(String, CleanupFn)>>,
    shutdown_tx: watch::Sender<bool>,
    complete_tx: watch::Sender<bool>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (complete_tx, _) = watch::channel(false);
        Self {
            config,
            phase: Mutex::new(ShutdownPhase::Running),
            stats: Mutex::new(ShutdownStats::default()),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            cleanup_tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            complete_tx,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    pub fn stats(&self) -> ShutdownStats {
        self.stats.lock().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    pub fn should_accept_connections(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }

    /// Track a downstream connection; the close fn is invoked during the
    /// CLOSING phase if the connection has not gone away by itself.
    pub fn register_connection(&self, close: CloseFn) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id, close);
        id
    }

    pub fn unregister_connection(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Register a cleanup task for the CLEANUP phase
    pub fn register_cleanup(&self, name: impl Into<String>, task: CleanupFn) {
        self.cleanup_tasks.lock().push((name.into(), task));
    }

    /// Resolves once shutdown has been requested
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the TERMINATED phase is reached
    pub async fn wait_for_completion(&self) {
        let mut rx = self.complete_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        *self.phase.lock() = phase;
        info!(phase = ?phase, "shutdown phase");
    }

    /// Run the full shutdown sequence. Idempotent: later calls return
    /// after the first completes.
    pub async fn shutdown(self: &Arc<Self>, reason: &str) {
        let already_running = {
            let mut phase = self.phase.lock();
            if *phase != ShutdownPhase::Running {
                false
            } else {
                *phase = ShutdownPhase::Draining;
                true
            }
        };
        if !already_running {
            self.wait_for_completion().await;
            return;
        }

        info!(reason, "starting graceful shutdown");
        {
            let mut stats = self.stats.lock();
            stats.started_at = Some(Instant::now());
            stats.connections_at_start = self.active_connections();
        }
        let _ = self.shutdown_tx.send(true);

        let force_task = {
            let shutdown = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(shutdown.config.force_timeout).await;
                shutdown.stats.lock().forced = true;
                error!("forced shutdown: timeout expired");
                std::process::exit(1);
            })
        };

        self.drain_connections().await;
        self.close_connections().await;
        self.run_cleanup().await;

        force_task.abort();
        self.set_phase(ShutdownPhase::Terminated);
        self.stats.lock().finished_at = Some(Instant::now());
        let _ = self.complete_tx.send(true);
        info!("graceful shutdown complete");
    }

    /// Phase 1: wait for connections to drop to zero. The timer restarts
    /// whenever progress is observed.
    async fn drain_connections(&self) {
        self.set_phase(ShutdownPhase::Draining);

        let mut window_start = Instant::now();
        let mut last_count = self.active_connections();

        while self.active_connections() > 0 {
            if window_start.elapsed() >= self.config.drain_timeout {
                warn!(
                    remaining = self.active_connections(),
                    "drain timeout reached"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;

            let count = self.active_connections();
            if count < last_count {
                last_count = count;
                window_start = Instant::now();
            }
        }

        self.stats.lock().connections_remaining_after_drain = self.active_connections();
    }

    /// Phase 2: actively close whatever connections remain
    async fn close_connections(&self) {
        self.set_phase(ShutdownPhase::Closing);

        let closers: Vec<(u64, CloseFn)> =
            { self.connections.lock().drain().collect() };
        if closers.is_empty() {
            return;
        }

        let count = closers.len();
        let close_all = futures::future::join_all(
            closers.into_iter().map(|(_, close)| close()),
        );
        if tokio::time::timeout(self.config.close_timeout, close_all)
            .await
            .is_err()
        {
            warn!("timeout closing connections");
        }
        self.stats.lock().connections_closed = count;
    }

    /// Phase 3: run registered cleanup tasks concurrently, recording
    /// per-task success or failure.
    async fn run_cleanup(&self) {
        self.set_phase(ShutdownPhase::Cleanup);

        let tasks: Vec<(String, CleanupFn)> =
            { std::mem::take(&mut *self.cleanup_tasks.lock()) };
        if tasks.is_empty() {
            return;
        }

        let names: Vec<String> = tasks.iter().map(|(name, _)| name.clone()).collect();
        let running = futures::future::join_all(tasks.into_iter().map(|(_, task)| task()));

        match tokio::time::timeout(self.config.cleanup_timeout, running).await {
            Ok(results) => {
                let mut stats = self.stats.lock();
                for (name, result) in names.iter().zip(results) {
                    match result {
                        Ok(()) => stats.cleanup_tasks_completed += 1,
                        Err(e) => {
                            stats.cleanup_tasks_failed += 1;
                            error!(task = %name, error = %e, "cleanup task failed");
                        }
                    }
                }
            }
            Err(_) => {
                warn!("timeout during cleanup");
                self.stats.lock().cleanup_tasks_failed += names.len();
            }
        }
    }

    /// Spawn listeners for SIGTERM, SIGINT and (on unix) SIGHUP that kick
    /// off the shutdown sequence.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let shutdown = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "cannot install SIGTERM handler");
                        return;
                    }
                };
                let mut hup = match signal(SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "cannot install SIGHUP handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => shutdown.shutdown("SIGINT").await,
                    _ = term.recv() => shutdown.shutdown("SIGTERM").await,
                    _ = hup.recv() => shutdown.shutdown("SIGHUP").await,
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.shutdown("SIGINT").await;
                }
            }
        });
    }
}
