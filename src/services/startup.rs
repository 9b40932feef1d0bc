// Router bookkeeping
//
// Handles the packets the router itself pushes at us: the startup-reply
// that completes the handshake, mudlist updates, and error packets. The
// reply also triggers re-subscription of any channels we were listening to
// before a reconnect.

use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::network::connection::ConnectionManager;
use crate::protocol::{Packet, PacketHeader, PacketType, DEFAULT_TTL};
use crate::services::{Service, ServiceMetrics};
use crate::state::StateManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

pub struct StartupService {
    state: Arc<StateManager>,
    manager: Arc<ConnectionManager>,
    mud_name: String,
    events: EventBus,
    metrics: ServiceMetrics,
    /// Password assigned by the router, replayed on the next handshake
    password: Mutex<i32>,
}

impl StartupService {
    pub fn new(
        state: Arc<StateManager>,
        manager: Arc<ConnectionManager>,
        mud_name: String,
        events: EventBus,
    ) -> Self {
        Self {
            state,
            manager,
            mud_name,
            events,
            metrics: ServiceMetrics::default(),
            password: Mutex::new(0),
        }
    }

    pub fn password(&self) -> i32 {
        *self.password.lock()
    }

    async fn handle_startup_reply(
        &self,
        header: PacketHeader,
        router_list: Vec<(String, String)>,
        password: i32,
    ) {
        *self.password.lock() = password;
        info!(
            router = %header.originator_mud,
            routers = router_list.len(),
            "startup handshake complete"
        );

        self.manager.mark_ready().await;

        // Re-announce every channel we were listening to before the
        // reconnect; the router forgot them along with the old link.
        let router_mud = header.originator_mud.clone();
        for channel in self.manager.subscribed_channels() {
            let listen = Packet::ChannelListen {
                header: PacketHeader::new(DEFAULT_TTL, &self.mud_name, "", &router_mud, ""),
                channel,
                on: true,
            };
            self.manager.send_packet(&listen).await;
        }

        self.events.emit(GatewayEvent::Connected {
            router: header.originator_mud,
        });
    }
}

#[async_trait]
impl Service for StartupService {
    fn name(&self) -> &'static str {
        "startup"
    }

    fn packet_types(&self) -> Vec<PacketType> {
        vec![
            PacketType::StartupReply,
            PacketType::Mudlist,
            PacketType::Error,
        ]
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        self.metrics.record_handled();
        match packet {
            Packet::StartupReply {
                header,
                router_list,
                password,
            } => {
                self.handle_startup_reply(header, router_list, password).await;
                Ok(None)
            }
            Packet::Mudlist {
                mudlist_id, muds, ..
            } => {
                self.state.update_mudlist(&muds, mudlist_id).await;
                Ok(None)
            }
            Packet::Error {
                header,
                error_code,
                error_message,
                ..
            } => {
                warn!(
                    from = %header.originator_mud,
                    code = %error_code,
                    message = %error_message,
                    "error packet from network"
                );
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }
}
