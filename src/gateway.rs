// Gateway wiring
//
// Builds the whole core out of its parts and breaks the natural cycle
// between the connection manager, packet router and dispatcher with
// callbacks: the manager only sees a message callback, the dispatcher only
// sees a send-packet callback, and neither holds the other concretely.

use crate::config::Settings;
use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::network::connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, RouterInfo,
};
use crate::network::lpc::LpcValue;
use crate::protocol::{Packet, PacketHeader, DEFAULT_TTL};
use crate::services::channel::{ChannelRecord, ChannelService};
use crate::services::finger::FingerService;
use crate::services::locate::{LocateResult, LocateService};
use crate::services::router::{PacketOrigin, PacketRouter};
use crate::services::startup::StartupService;
use crate::services::tell::TellService;
use crate::services::who::WhoService;
use crate::services::{SendPacket, ServiceDispatcher, ServiceRegistry};
use crate::state::{ChannelInfo, MudInfo, StateManager, UserSession};
use crate::util::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::util::retry::{BackoffStrategy, RetryConfig, RetryManager};
use once_cell::sync::OnceCell;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub struct Gateway {
    settings: Settings,
    state: Arc<StateManager>,
    manager: Arc<ConnectionManager>,
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<ServiceDispatcher>,
    router: Arc<OnceCell<Arc<PacketRouter>>>,
    events: EventBus,

    tell: Arc<TellService>,
    channel: Arc<ChannelService>,
    who: Arc<WhoService>,
    finger: Arc<FingerService>,
    locate: Arc<LocateService>,
    startup: Arc<StartupService>,

    breakers: Arc<CircuitBreakerManager>,
    retries: Arc<RetryManager>,

    started_at: Instant,
}

impl Gateway {
    pub fn new(settings: Settings) -> Arc<Self> {
        let mud_name = settings.mud.name.clone();
        let state = Arc::new(StateManager::new(Some(PathBuf::from(
            &settings.gateway.state_dir,
        ))));

        let routers = settings
            .router_endpoints()
            .into_iter()
            .map(|(ep, priority)| {
                let name = if ep.name.is_empty() {
                    format!("{}:{}", ep.host, ep.port)
                } else {
                    ep.name.clone()
                };
                RouterInfo::new(name, ep.host, ep.port, priority)
            })
            .collect();

        let manager = Arc::new(ConnectionManager::new(
            routers,
            ConnectionConfig {
                connection_timeout: Duration::from_secs(settings.gateway.timeout),
                keepalive_interval: Duration::from_secs(settings.gateway.keepalive_interval),
                max_frame_len: settings.gateway.max_packet_size,
                jitter_seed: None,
            },
        ));

        let events = EventBus::new();

        // Outbound packets from services and handler replies go through the
        // packet router; the cell defers the cycle until it is built.
        let router_cell: Arc<OnceCell<Arc<PacketRouter>>> = Arc::new(OnceCell::new());
        let route_out: SendPacket = {
            let cell = Arc::clone(&router_cell);
            Arc::new(move |packet| {
                let cell = Arc::clone(&cell);
                Box::pin(async move {
                    match cell.get() {
                        Some(router) => router.route(packet, PacketOrigin::Local).await,
                        None => false,
                    }
                })
            })
        };

        let tell = Arc::new(TellService::new(
            Arc::clone(&state),
            Arc::clone(&route_out),
            mud_name.clone(),
            events.clone(),
        ));
        let channel = Arc::new(ChannelService::new(
            Arc::clone(&state),
            Arc::clone(&route_out),
            mud_name.clone(),
            events.clone(),
        ));
        let who = Arc::new(WhoService::new(
            Arc::clone(&state),
            Arc::clone(&route_out),
            mud_name.clone(),
            events.clone(),
        ));
        let finger = Arc::new(FingerService::new(
            Arc::clone(&state),
            Arc::clone(&route_out),
            mud_name.clone(),
            events.clone(),
        ));
        let locate = Arc::new(LocateService::new(
            Arc::clone(&state),
            Arc::clone(&route_out),
            mud_name.clone(),
            events.clone(),
        ));
        let startup = Arc::new(StartupService::new(
            Arc::clone(&state),
            Arc::clone(&manager),
            mud_name.clone(),
            events.clone(),
        ));

        let registry = Arc::new(ServiceRegistry::new());
        registry.register(tell.clone());
        registry.register(channel.clone());
        registry.register(who.clone());
        registry.register(finger.clone());
        registry.register(locate.clone());
        registry.register(startup.clone());

        let dispatcher = Arc::new(ServiceDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&route_out),
            mud_name.clone(),
        ));

        let breakers = Arc::new(CircuitBreakerManager::new());
        let retries = Arc::new(RetryManager::new());

        // Upstream sends bypass routing (they are already directed) but go
        // through a breaker so a dead link stops burning send attempts
        let send_upstream: SendPacket = {
            let manager = Arc::clone(&manager);
            let breaker = breakers.breaker(
                "router-send",
                CircuitBreakerConfig {
                    failure_threshold: 10,
                    success_threshold: 2,
                    timeout: Duration::from_secs(5),
                },
            );
            Arc::new(move |packet| {
                let manager = Arc::clone(&manager);
                let breaker = Arc::clone(&breaker);
                Box::pin(async move {
                    breaker
                        .call(|| async {
                            if manager.send_packet(&packet).await {
                                Ok(())
                            } else {
                                Err(crate::error::GatewayError::NotConnected)
                            }
                        })
                        .await
                        .is_ok()
                })
            })
        };

        let packet_router = Arc::new(PacketRouter::new(
            mud_name,
            Arc::clone(&state),
            Arc::clone(&dispatcher),
            send_upstream,
        ));
        router_cell
            .set(packet_router)
            .unwrap_or_else(|_| unreachable!("router cell set twice"));

        Arc::new(Self {
            settings,
            state,
            manager,
            registry,
            dispatcher,
            router: router_cell,
            events,
            tell,
            channel,
            who,
            finger,
            locate,
            startup,
            breakers,
            retries,
            started_at: Instant::now(),
        })
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn packet_router(&self) -> &Arc<PacketRouter> {
        self.router.get().expect("router wired at construction")
    }

    pub fn mud_name(&self) -> &str {
        &self.settings.mud.name
    }

    /// Start state, dispatch, the inbound wiring, and the router link
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.state.start().await;
        self.dispatcher.start();

        // Inbound values become typed packets and enter the router
        {
            let gateway = Arc::clone(self);
            self.manager
                .set_message_callback(Arc::new(move |value: LpcValue| {
                    let gateway = Arc::clone(&gateway);
                    Box::pin(async move {
                        match Packet::from_lpc(value) {
                            Ok(packet) => {
                                gateway
                                    .packet_router()
                                    .route(packet, PacketOrigin::Inbound)
                                    .await;
                            }
                            Err(e) => warn!(error = %e, "discarding malformed packet"),
                        }
                    })
                }));
        }

        // TCP up means start the I3 handshake; loss is announced downstream
        {
            let gateway = Arc::clone(self);
            self.manager
                .set_state_callback(Arc::new(move |conn_state: ConnectionState| {
                    let gateway = Arc::clone(&gateway);
                    Box::pin(async move {
                        match conn_state {
                            ConnectionState::Connected => gateway.send_startup().await,
                            ConnectionState::Disconnected => {
                                gateway.events.emit(GatewayEvent::Disconnected {
                                    router: gateway
                                        .manager
                                        .current_router()
                                        .map(|r| r.name)
                                        .unwrap_or_default(),
                                });
                            }
                            _ => {}
                        }
                    })
                }));
        }

        // First connection gets a bounded retry; after that the manager's
        // own backoff takes over.
        let connect_policy = self.retries.policy(
            "initial-connect",
            RetryConfig {
                max_attempts: self.settings.gateway.retry_attempts.max(1),
                initial_delay: Duration::from_secs_f64(self.settings.gateway.retry_delay),
                strategy: BackoffStrategy::Exponential,
                ..RetryConfig::default()
            },
        );
        let manager = Arc::clone(&self.manager);
        let connected = connect_policy
            .execute(|| {
                let manager = Arc::clone(&manager);
                async move {
                    if manager.connect().await {
                        Ok(())
                    } else {
                        Err(crate::error::GatewayError::NotConnected)
                    }
                }
            })
            .await
            .is_ok();
        if !connected {
            warn!("initial router connection failed; reconnect is scheduled");
        }
        info!(mud = %self.settings.mud.name, "gateway started");
        Ok(())
    }

    /// Send the startup-req-3 handshake to the current router
    async fn send_startup(self: &Arc<Self>) {
        let Some(router) = self.manager.current_router() else {
            return;
        };

        let mud = &self.settings.mud;
        let services: Vec<(LpcValue, LpcValue)> = mud
            .services
            .iter()
            .map(|(name, flag)| (LpcValue::string(name.clone()), LpcValue::Int(*flag)))
            .collect();

        let packet = Packet::StartupReq3 {
            header: PacketHeader::new(DEFAULT_TTL, &mud.name, "", &router.name, ""),
            password: self.startup.password(),
            old_mudlist_id: self.state.mudlist_id().await,
            old_chanlist_id: self.state.chanlist_id().await,
            player_port: mud.port as i32,
            tcp_port: 0,
            udp_port: 0,
            mudlib: mud.mudlib.clone(),
            base_mudlib: mud.base_mudlib.clone(),
            driver: mud.driver.clone(),
            mud_type: mud.mud_type.clone(),
            open_status: mud.open_status.clone(),
            admin_email: mud.admin_email.clone(),
            services,
            other_data: LpcValue::Int(0),
        };

        if self.manager.send_packet(&packet).await {
            self.manager.mark_authenticating().await;
        } else {
            error!("failed to send startup handshake");
        }
    }

    /// Update the no-op keepalive payload to match our subscriptions
    fn refresh_keepalive(&self) {
        let payload = self
            .manager
            .subscribed_channels()
            .first()
            .zip(self.manager.current_router())
            .map(|(channel, router)| {
                Packet::ChannelListen {
                    header: PacketHeader::new(
                        DEFAULT_TTL,
                        &self.settings.mud.name,
                        "",
                        &router.name,
                        "",
                    ),
                    channel: channel.clone(),
                    on: true,
                }
                .to_lpc()
            });
        self.manager.set_keepalive_payload(payload);
    }

    // ------------------------------------------------------------------
    // Operations consumed by the downstream surface
    // ------------------------------------------------------------------

    /// Find or create the session backing a local user
    pub async fn session_for_user(&self, user: &str) -> UserSession {
        match self.state.find_session_by_user(user).await {
            Some(session) => session,
            None => self.state.create_session(&self.settings.mud.name, user).await,
        }
    }

    pub async fn send_tell(
        &self,
        from_user: &str,
        target_mud: &str,
        target_user: &str,
        message: &str,
        visname: Option<&str>,
    ) -> bool {
        self.session_for_user(from_user).await;
        self.tell
            .send_tell(from_user, target_user, target_mud, message, visname)
            .await
    }

    pub async fn send_emoteto(
        &self,
        from_user: &str,
        target_mud: &str,
        target_user: &str,
        message: &str,
        visname: Option<&str>,
    ) -> bool {
        self.session_for_user(from_user).await;
        self.tell
            .send_emoteto(from_user, target_user, target_mud, message, visname)
            .await
    }

    pub async fn channel_send(&self, from_user: &str, channel: &str, message: &str) -> bool {
        self.session_for_user(from_user).await;
        self.channel
            .send_channel_message(from_user, channel, message, false)
            .await
    }

    pub async fn channel_emote(&self, from_user: &str, channel: &str, message: &str) -> bool {
        self.session_for_user(from_user).await;
        self.channel
            .send_channel_message(from_user, channel, message, true)
            .await
    }

    pub async fn channel_join(&self, user: &str, channel: &str) -> bool {
        let session = self.session_for_user(user).await;
        if !self
            .channel
            .join_channel(&session.session_id, channel, user)
            .await
        {
            return false;
        }
        self.manager.subscribe_channel(channel);
        self.refresh_keepalive();

        if let Some(router) = self.manager.current_router() {
            let listen = Packet::ChannelListen {
                header: PacketHeader::new(DEFAULT_TTL, &self.settings.mud.name, "", &router.name, ""),
                channel: channel.to_string(),
                on: true,
            };
            self.manager.send_packet(&listen).await;
        }
        true
    }

    pub async fn channel_leave(&self, user: &str, channel: &str) -> bool {
        let session = self.session_for_user(user).await;
        if !self
            .channel
            .leave_channel(&session.session_id, channel, user)
            .await
        {
            return false;
        }
        self.manager.unsubscribe_channel(channel);
        self.refresh_keepalive();

        if let Some(router) = self.manager.current_router() {
            let listen = Packet::ChannelListen {
                header: PacketHeader::new(DEFAULT_TTL, &self.settings.mud.name, "", &router.name, ""),
                channel: channel.to_string(),
                on: false,
            };
            self.manager.send_packet(&listen).await;
        }
        true
    }

    pub async fn channel_list(&self) -> Vec<ChannelInfo> {
        self.state.list_channels().await
    }

    pub async fn channel_who(&self, channel: &str) -> Vec<String> {
        self.channel.local_channel_users(channel).await
    }

    pub fn channel_history(&self, channel: &str) -> Vec<ChannelRecord> {
        self.channel.channel_history(channel)
    }

    pub async fn who(
        &self,
        from_user: &str,
        target_mud: &str,
    ) -> Option<Vec<LpcValue>> {
        self.session_for_user(from_user).await;
        self.who.who_request(from_user, target_mud, vec![]).await
    }

    pub async fn finger(
        &self,
        from_user: &str,
        target_mud: &str,
        target_user: &str,
    ) -> Option<Vec<(LpcValue, LpcValue)>> {
        self.session_for_user(from_user).await;
        self.finger
            .finger_user(from_user, target_mud, target_user)
            .await
    }

    pub async fn locate(&self, from_user: &str, user: &str) -> Option<LocateResult> {
        self.session_for_user(from_user).await;
        self.locate.locate_user(from_user, user, None).await
    }

    pub async fn mudlist(&self) -> Vec<MudInfo> {
        self.state.all_muds().await
    }

    pub async fn reconnect(&self) -> bool {
        self.manager.disconnect().await;
        // connect() needs the Arc for its spawned loops
        let manager = Arc::clone(&self.manager);
        manager.connect().await
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn status(&self) -> serde_json::Value {
        json!({
            "mud_name": self.settings.mud.name,
            "connection": format!("{:?}", self.manager.state()),
            "router": self.manager.current_router().map(|r| r.name),
            "mudlist_id": self.state.mudlist_id().await,
            "chanlist_id": self.state.chanlist_id().await,
            "uptime_seconds": self.uptime().as_secs(),
        })
    }

    pub async fn stats(&self) -> serde_json::Value {
        let conn = self.manager.stats();
        let routing = self.packet_router().stats();
        let services: serde_json::Map<String, serde_json::Value> = self
            .registry
            .service_names()
            .into_iter()
            .filter_map(|name| {
                self.registry
                    .get(name)
                    .map(|s| (name.to_string(), json!(s.metrics().handled())))
            })
            .collect();

        json!({
            "connection": {
                "packets_sent": conn.packets_sent,
                "packets_received": conn.packets_received,
                "bytes_sent": conn.bytes_sent,
                "bytes_received": conn.bytes_received,
                "reconnect_count": conn.reconnect_count,
                "last_error": conn.last_error,
            },
            "routing": {
                "local": routing.packets_routed_local.load(std::sync::atomic::Ordering::Relaxed),
                "remote": routing.packets_routed_remote.load(std::sync::atomic::Ordering::Relaxed),
                "broadcast": routing.packets_broadcast.load(std::sync::atomic::Ordering::Relaxed),
                "dropped": routing.packets_dropped.load(std::sync::atomic::Ordering::Relaxed),
            },
            "packets_handled": services,
            "sessions": self.state.session_count().await,
            "muds": self.state.mud_count().await,
        })
    }

    /// Stop all loops and persist state
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.dispatcher.stop();
        self.manager.disconnect().await;
        self.state.stop().await;
    }
}
