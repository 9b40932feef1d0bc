// Service dispatch
//
// Inbound packets that are for this MUD get handed to a per-service handler
// looked up by packet type. A bounded queue sits in front of the dispatcher
// so a slow handler can never stall the receive loop.

pub mod channel;
pub mod finger;
pub mod locate;
pub mod router;
pub mod startup;
pub mod tell;
pub mod who;

use crate::error::Result;
use crate::protocol::{Packet, PacketType};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Callback used by services and the router to push a packet upstream
pub type SendPacket = Arc<dyn Fn(Packet) -> BoxFuture<'static, bool> + Send + Sync>;

/// One in-flight request awaiting a reply from the network.
///
/// Keyed by "originator_user:target"; the notify is a single-shot wakeup
/// and the slot carries the reply to the waiter.
struct PendingEntry<T> {
    notify: Arc<tokio::sync::Notify>,
    result: Arc<Mutex<Option<T>>>,
    created_at: std::time::Instant,
}

/// Per-service table of requests waiting on replies
pub struct PendingRequests<T> {
    entries: Mutex<std::collections::HashMap<String, PendingEntry<T>>>,
}

impl<T: Clone + Send + 'static> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Register a waiter and block up to `timeout` for its reply
    pub async fn wait(&self, key: &str, timeout: std::time::Duration) -> Option<T> {
        let (notify, result) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| PendingEntry {
                    notify: Arc::new(tokio::sync::Notify::new()),
                    result: Arc::new(Mutex::new(None)),
                    created_at: std::time::Instant::now(),
                });
            (Arc::clone(&entry.notify), Arc::clone(&entry.result))
        };

        let _ = tokio::time::timeout(timeout, notify.notified()).await;

        self.entries.lock().remove(key);
        let value = result.lock().take();
        value
    }

    /// Deliver a reply; false when nobody is waiting under that key
    pub fn complete(&self, key: &str, value: T) -> bool {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => {
                *entry.result.lock() = Some(value);
                entry.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Drop requests older than the given age
    pub fn sweep(&self, max_age: std::time::Duration) {
        self.entries
            .lock()
            .retain(|_, entry| entry.created_at.elapsed() < max_age);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Per-service counters
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    pub packets_handled: AtomicU64,
    pub errors: AtomicU64,
}

impl ServiceMetrics {
    pub fn record_handled(&self) {
        self.packets_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handled(&self) -> u64 {
        self.packets_handled.load(Ordering::Relaxed)
    }
}

/// A packet handler for one I3 service
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Packet types this service accepts
    fn packet_types(&self) -> Vec<PacketType>;

    /// Whether requests must come from an authenticated session
    fn requires_auth(&self) -> bool {
        false
    }

    /// Check a packet before handling; false drops it silently
    async fn validate_packet(&self, packet: &Packet) -> bool {
        packet
            .packet_type()
            .map(|t| self.packet_types().contains(&t))
            .unwrap_or(false)
    }

    /// Handle a packet, optionally producing a reply to route back
    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>>;

    fn metrics(&self) -> &ServiceMetrics;
}

/// Registry of services keyed by name, with a packet-type index
#[derive(Default)]
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn Service>>,
    by_type: DashMap<PacketType, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn Service>) {
        for ptype in service.packet_types() {
            self.by_type.insert(ptype, Arc::clone(&service));
        }
        self.by_name.insert(service.name(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.by_name.get(name).map(|s| Arc::clone(&s))
    }

    pub fn for_packet_type(&self, ptype: PacketType) -> Option<Arc<dyn Service>> {
        self.by_type.get(&ptype).map(|s| Arc::clone(&s))
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.by_name.iter().map(|entry| *entry.key()).collect()
    }
}

/// Counters for the dispatch path
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub dispatched: AtomicU64,
    pub dropped_validation: AtomicU64,
    pub unknown_type: AtomicU64,
    pub handler_errors: AtomicU64,
}

/// Pulls local-delivery packets off the ingress queue and invokes handlers
pub struct ServiceDispatcher {
    registry: Arc<ServiceRegistry>,
    send_packet: SendPacket,
    mud_name: String,
    queue_tx: mpsc::Sender<Packet>,
    queue_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    stats: Arc<DispatcherStats>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServiceDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, send_packet: SendPacket, mud_name: String) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(1024);
        Self {
            registry,
            send_packet,
            mud_name,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stats: Arc::new(DispatcherStats::default()),
            worker: Mutex::new(None),
        }
    }

    /// Queue a packet for handling; false when the queue is full
    pub async fn enqueue(&self, packet: Packet) -> bool {
        self.queue_tx.send(packet).await.is_ok()
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Start the worker that drains the ingress queue
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            return;
        };
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                dispatcher.dispatch(packet).await;
            }
        });
        *self.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    /// Route one packet through validation and its handler
    pub async fn dispatch(&self, packet: Packet) {
        let service = packet
            .packet_type()
            .and_then(|t| self.registry.for_packet_type(t));

        let Some(service) = service else {
            self.stats.unknown_type.fetch_add(1, Ordering::Relaxed);
            warn!(tag = packet.type_tag(), "no handler for packet type");
            let reply = Packet::error_reply(
                &packet,
                &self.mud_name,
                "unk-type",
                &format!("unknown packet type: {}", packet.type_tag()),
            );
            (self.send_packet)(reply).await;
            return;
        };

        if !service.validate_packet(&packet).await {
            self.stats.dropped_validation.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match service.handle_packet(packet).await {
            Ok(Some(reply)) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                (self.send_packet)(reply).await;
            }
            Ok(None) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                service.metrics().record_error();
                error!(service = service.name(), error = %e, "handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketHeader;
    use tokio::sync::mpsc::UnboundedSender;

    struct EchoService {
        metrics: ServiceMetrics,
        accept: bool,
    }

    #[async_trait]
    impl Service for EchoService {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn packet_types(&self) -> Vec<PacketType> {
            vec![PacketType::Tell]
        }

        async fn validate_packet(&self, _packet: &Packet) -> bool {
            self.accept
        }

        async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
            self.metrics.record_handled();
            Ok(Some(packet))
        }

        fn metrics(&self) -> &ServiceMetrics {
            &self.metrics
        }
    }

    fn capture_sender() -> (SendPacket, tokio::sync::mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let tx: UnboundedSender<Packet> = tx;
        let send: SendPacket = Arc::new(move |packet| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(packet);
                true
            })
        });
        (send, rx)
    }

    fn tell_packet() -> Packet {
        Packet::Tell {
            header: PacketHeader::new(200, "MudA", "alice", "TestMUD", "bob"),
            visname: "Alice".to_string(),
            message: "hi".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_and_sends_reply() {
        let registry = Arc::new(ServiceRegistry::new());
        let service = Arc::new(EchoService {
            metrics: ServiceMetrics::default(),
            accept: true,
        });
        registry.register(service.clone());

        let (send, mut rx) = capture_sender();
        let dispatcher = Arc::new(ServiceDispatcher::new(registry, send, "TestMUD".to_string()));

        dispatcher.dispatch(tell_packet()).await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(service.metrics().handled(), 1);
        assert_eq!(dispatcher.stats().dispatched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_synthesizes_error() {
        let registry = Arc::new(ServiceRegistry::new());
        let (send, mut rx) = capture_sender();
        let dispatcher = Arc::new(ServiceDispatcher::new(registry, send, "TestMUD".to_string()));

        dispatcher.dispatch(tell_packet()).await;

        match rx.try_recv().unwrap() {
            Packet::Error {
                header, error_code, ..
            } => {
                assert_eq!(error_code, "unk-type");
                assert_eq!(header.target_mud, "MudA");
                assert_eq!(header.target_user, "alice");
            }
            other => panic!("expected error reply, got {:?}", other),
        }
        assert_eq!(dispatcher.stats().unknown_type.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_drops_silently() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(Arc::new(EchoService {
            metrics: ServiceMetrics::default(),
            accept: false,
        }));

        let (send, mut rx) = capture_sender();
        let dispatcher = Arc::new(ServiceDispatcher::new(registry, send, "TestMUD".to_string()));

        dispatcher.dispatch(tell_packet()).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(
            dispatcher.stats().dropped_validation.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_pending_request_completion() {
        let pending: Arc<PendingRequests<String>> = Arc::new(PendingRequests::new());

        let waiter = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                pending
                    .wait("alice:ghost", std::time::Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(pending.complete("alice:ghost", "found".to_string()));

        assert_eq!(waiter.await.unwrap(), Some("found".to_string()));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_pending_request_timeout() {
        let pending: PendingRequests<String> = PendingRequests::new();
        let result = pending
            .wait("alice:ghost", std::time::Duration::from_millis(20))
            .await;
        assert_eq!(result, None);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_complete_without_waiter() {
        let pending: PendingRequests<i32> = PendingRequests::new();
        assert!(!pending.complete("nobody:home", 1));
    }

    #[tokio::test]
    async fn test_pending_sweep_drops_aged_entries() {
        let pending: Arc<PendingRequests<i32>> = Arc::new(PendingRequests::new());
        let waiter = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                pending
                    .wait("slow:reply", std::time::Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(pending.len(), 1);

        pending.sweep(std::time::Duration::from_millis(1));
        assert!(pending.is_empty());
        // The swept waiter just times out with no result
        drop(waiter);
    }

    #[tokio::test]
    async fn test_queue_worker_drains() {
        let registry = Arc::new(ServiceRegistry::new());
        let service = Arc::new(EchoService {
            metrics: ServiceMetrics::default(),
            accept: true,
        });
        registry.register(service.clone());

        let (send, mut rx) = capture_sender();
        let dispatcher = Arc::new(ServiceDispatcher::new(registry, send, "TestMUD".to_string()));
        dispatcher.start();

        assert!(dispatcher.enqueue(tell_packet()).await);
        assert!(dispatcher.enqueue(tell_packet()).await);

        let mut seen = 0;
        while seen < 2 {
            tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen += 1;
        }
        assert_eq!(service.metrics().handled(), 2);
        dispatcher.stop();
    }
}
