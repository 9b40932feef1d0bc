// Router connection management
//
// Maintains the single upstream link to an I3 router: priority-ordered
// failover across the configured routers, exponential backoff with jitter,
// keepalive, and the receive loop that feeds decoded values to the
// dispatcher. The manager only knows callbacks, never the dispatcher or the
// state store, which keeps the wiring acyclic.

use crate::network::lpc::LpcValue;
use crate::network::mudmode::{encode_frame, FrameReader};
use crate::protocol::Packet;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Base backoff in seconds after the first failure
const BASE_BACKOFF_SECS: f64 = 5.0;
/// Backoff ceiling in seconds
const MAX_BACKOFF_SECS: f64 = 300.0;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Ready,
    Error,
    Closing,
}

/// One configured I3 router and its attempt bookkeeping
#[derive(Debug, Clone)]
pub struct RouterInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Lower is tried first
    pub priority: u32,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub failure_count: u32,
}

impl RouterInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, priority: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            priority,
            last_attempt: None,
            last_success: None,
            failure_count: 0,
        }
    }

    /// Exponential backoff capped at five minutes, before jitter
    pub fn base_backoff(&self) -> Duration {
        if self.failure_count == 0 {
            return Duration::ZERO;
        }
        let backoff =
            (BASE_BACKOFF_SECS * 2f64.powi(self.failure_count as i32 - 1)).min(MAX_BACKOFF_SECS);
        Duration::from_secs_f64(backoff)
    }

    /// Backoff with 0-10% jitter added to avoid thundering herds
    pub fn backoff_time(&self, rng: &mut StdRng) -> Duration {
        let base = self.base_backoff();
        if base.is_zero() {
            return base;
        }
        let jitter = rng.random_range(0.0..base.as_secs_f64() * 0.1);
        base + Duration::from_secs_f64(jitter)
    }

    /// Whether enough time has passed since the last failed attempt
    pub fn can_attempt(&self, rng: &mut StdRng) -> bool {
        if self.failure_count == 0 {
            return true;
        }
        match self.last_attempt {
            Some(at) => at.elapsed() >= self.backoff_time(rng),
            None => true,
        }
    }
}

/// Counters for the upstream link
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    pub last_error: Option<String>,
    pub connected_at: Option<Instant>,
}

/// Tunables for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connection_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_frame_len: usize,
    /// Seed for the jitter source; None draws from entropy
    pub jitter_seed: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            max_frame_len: 65536,
            jitter_seed: None,
        }
    }
}

pub type MessageCallback = Arc<dyn Fn(LpcValue) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Manages the single connection to an I3 router with failover and
/// automatic reconnection.
pub struct ConnectionManager {
    routers: Mutex<Vec<RouterInfo>>,
    config: ConnectionConfig,

    state: Mutex<ConnectionState>,
    current_router: Mutex<Option<RouterInfo>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    stats: Mutex<ConnectionStats>,
    rng: Mutex<StdRng>,

    on_message: Mutex<Option<MessageCallback>>,
    on_state_change: Mutex<Option<StateCallback>>,

    /// Packet re-sent periodically to keep the router from idling us out
    keepalive_payload: Mutex<Option<LpcValue>>,
    /// Channels to re-subscribe after a reconnect handshake
    subscribed_channels: Mutex<std::collections::HashSet<String>>,

    closing: AtomicBool,
    receive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    keepalive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    reconnect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(mut routers: Vec<RouterInfo>, config: ConnectionConfig) -> Self {
        routers.sort_by_key(|r| r.priority);
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            routers: Mutex::new(routers),
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            current_router: Mutex::new(None),
            writer: AsyncMutex::new(None),
            stats: Mutex::new(ConnectionStats::default()),
            rng: Mutex::new(rng),
            on_message: Mutex::new(None),
            on_state_change: Mutex::new(None),
            keepalive_payload: Mutex::new(None),
            subscribed_channels: Mutex::new(std::collections::HashSet::new()),
            closing: AtomicBool::new(false),
            receive_task: Mutex::new(None),
            keepalive_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
        }
    }

    /// Install the inbound message callback; expected to feed the dispatcher
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.lock() = Some(callback);
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        *self.on_state_change.lock() = Some(callback);
    }

    pub fn set_keepalive_payload(&self, payload: Option<LpcValue>) {
        *self.keepalive_payload.lock() = payload;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Ready
        )
    }

    pub fn current_router(&self) -> Option<RouterInfo> {
        self.current_router.lock().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }

    pub fn routers(&self) -> Vec<RouterInfo> {
        self.routers.lock().clone()
    }

    pub fn subscribe_channel(&self, channel: &str) {
        self.subscribed_channels.lock().insert(channel.to_string());
    }

    pub fn unsubscribe_channel(&self, channel: &str) {
        self.subscribed_channels.lock().remove(channel);
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscribed_channels.lock().iter().cloned().collect()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let callback = self.on_state_change.lock().clone();
        if let Some(cb) = callback {
            cb(state).await;
        }
    }

    /// Mark the startup handshake as in flight
    pub async fn mark_authenticating(&self) {
        self.set_state(ConnectionState::Authenticating).await;
    }

    /// Mark the link fully established (startup-reply received)
    pub async fn mark_ready(&self) {
        self.set_state(ConnectionState::Ready).await;
    }

    /// Try each router in priority order, honoring per-router backoff.
    /// Returns true once a TCP connection is established.
    pub async fn connect(self: &Arc<Self>) -> bool {
        {
            let state = self.state();
            if !matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Error
            ) {
                return false;
            }
        }
        self.set_state(ConnectionState::Connecting).await;

        let candidates: Vec<RouterInfo> = self.routers.lock().clone();
        for router in candidates {
            {
                let mut rng = self.rng.lock();
                if !router.can_attempt(&mut rng) {
                    continue;
                }
            }
            self.update_router(&router.name, |r| r.last_attempt = Some(Instant::now()));

            debug!(router = %router.name, address = %router.address, port = router.port, "attempting router connection");
            let attempt = tokio::time::timeout(
                self.config.connection_timeout,
                TcpStream::connect((router.address.as_str(), router.port)),
            )
            .await;

            match attempt {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);

                    self.update_router(&router.name, |r| {
                        r.failure_count = 0;
                        r.last_success = Some(Instant::now());
                    });
                    *self.current_router.lock() = Some(router.clone());
                    self.stats.lock().connected_at = Some(Instant::now());

                    self.set_state(ConnectionState::Connected).await;
                    info!(router = %router.name, "connected to I3 router");

                    self.spawn_receive_loop(read_half);
                    self.spawn_keepalive_loop();
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(router = %router.name, error = %e, "router connection failed");
                    self.record_failure(&router.name, &e.to_string());
                }
                Err(_) => {
                    warn!(router = %router.name, "router connection timed out");
                    self.record_failure(&router.name, "connection timeout");
                }
            }
        }

        self.set_state(ConnectionState::Error).await;
        if !self.closing.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
        false
    }

    /// Close the link and cancel all background loops
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);

        for slot in [&self.reconnect_task, &self.keepalive_task, &self.receive_task] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }

        self.set_state(ConnectionState::Closing).await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.current_router.lock() = None;

        self.set_state(ConnectionState::Disconnected).await;
        self.closing.store(false, Ordering::SeqCst);
    }

    /// Send a raw LPC value; false unless the link is connected or ready
    pub async fn send_message(&self, value: &LpcValue) -> bool {
        if !self.is_connected() {
            return false;
        }
        let frame = encode_frame(value);

        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return false;
        };
        match w.write_all(&frame).await {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.packets_sent += 1;
                stats.bytes_sent += frame.len() as u64;
                true
            }
            Err(e) => {
                warn!(error = %e, "write to router failed");
                self.stats.lock().last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Send a typed packet
    pub async fn send_packet(&self, packet: &Packet) -> bool {
        self.send_message(&packet.to_lpc()).await
    }

    fn update_router<F: FnOnce(&mut RouterInfo)>(&self, name: &str, f: F) {
        let mut routers = self.routers.lock();
        if let Some(router) = routers.iter_mut().find(|r| r.name == name) {
            f(router);
        }
    }

    fn record_failure(&self, name: &str, error: &str) {
        self.update_router(name, |r| r.failure_count += 1);
        self.stats.lock().last_error = Some(error.to_string());
    }

    fn spawn_receive_loop(self: &Arc<Self>, mut reader: OwnedReadHalf) {
        let manager = Arc::clone(self);
        let max_frame_len = self.config.max_frame_len;
        let handle = tokio::spawn(async move {
            let mut framer = FrameReader::new(max_frame_len);
            let mut buf = vec![0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        manager.stats.lock().bytes_received += n as u64;
                        match framer.feed(&buf[..n]) {
                            Ok(values) => {
                                for value in values {
                                    manager.stats.lock().packets_received += 1;
                                    let callback = manager.on_message.lock().clone();
                                    if let Some(cb) = callback {
                                        cb(value).await;
                                    }
                                }
                            }
                            Err(e) => {
                                // Framer already reset itself; the stream is
                                // beyond recovery, so force a reconnect
                                error!(error = %e, "corrupt frame stream");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "router read failed");
                        break;
                    }
                }
            }
            manager.handle_connection_lost().await;
        });
        *self.receive_task.lock() = Some(handle);
    }

    fn spawn_keepalive_loop(self: &Arc<Self>) {
        if let Some(old) = self.keepalive_task.lock().take() {
            old.abort();
        }
        let manager = Arc::clone(self);
        let interval = self.config.keepalive_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !manager.is_connected() || manager.closing.load(Ordering::SeqCst) {
                    break;
                }
                // The router closes idle links; any outbound packet keeps it
                // open, so replay the configured no-op payload while READY.
                if manager.state() == ConnectionState::Ready {
                    let payload = manager.keepalive_payload.lock().clone();
                    if let Some(payload) = payload {
                        manager.send_message(&payload).await;
                    }
                }
            }
        });
        *self.keepalive_task.lock() = Some(handle);
    }

    async fn handle_connection_lost(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let lost = self.current_router.lock().take();
        if let Some(router) = lost {
            self.update_router(&router.name, |r| r.failure_count += 1);
            info!(router = %router.name, "router connection lost");
        }
        *self.writer.lock().await = None;

        self.set_state(ConnectionState::Disconnected).await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        self.stats.lock().reconnect_count += 1;

        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let delay = {
                let routers = manager.routers.lock();
                let mut rng = manager.rng.lock();
                routers
                    .iter()
                    .map(|r| r.backoff_time(&mut rng))
                    .min()
                    .unwrap_or(Duration::ZERO)
            };
            if !delay.is_zero() {
                debug!(delay_secs = delay.as_secs_f64(), "reconnect scheduled");
                tokio::time::sleep(delay).await;
            }
            if !manager.closing.load(Ordering::SeqCst) {
                manager.connect().await;
            }
        }));
    }
}
