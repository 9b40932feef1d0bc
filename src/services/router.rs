// Packet routing
//
// Decides what happens to every packet that enters the gateway: deliver to
// a local handler, forward upstream to the router, or drop with an error
// reply. TTL is decremented on every forward; packets arriving with an
// exhausted TTL are dropped without a reply.

use crate::protocol::Packet;
use crate::services::{SendPacket, ServiceDispatcher};
use crate::state::{MudStatus, StateManager};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a packet came from, which decides what broadcast means for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    /// Arrived on the router link; broadcast means we are a recipient
    Inbound,
    /// Originated by a local user; broadcast goes out to the network
    Local,
}

#[derive(Debug, Default)]
pub struct RouterStats {
    pub packets_routed_local: AtomicU64,
    pub packets_routed_remote: AtomicU64,
    pub packets_broadcast: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl RouterStats {
    pub fn total_routed(&self) -> u64 {
        self.packets_routed_local.load(Ordering::Relaxed)
            + self.packets_routed_remote.load(Ordering::Relaxed)
            + self.packets_broadcast.load(Ordering::Relaxed)
    }
}

/// Directs packets between the local dispatcher and the upstream link
pub struct PacketRouter {
    mud_name: String,
    state: Arc<StateManager>,
    dispatcher: Arc<ServiceDispatcher>,
    send_upstream: SendPacket,
    stats: RouterStats,
}

impl PacketRouter {
    pub fn new(
        mud_name: String,
        state: Arc<StateManager>,
        dispatcher: Arc<ServiceDispatcher>,
        send_upstream: SendPacket,
    ) -> Self {
        Self {
            mud_name,
            state,
            dispatcher,
            send_upstream,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Route one packet. Returns true when it was delivered or forwarded.
    pub async fn route(&self, mut packet: Packet, origin: PacketOrigin) -> bool {
        if packet.header().ttl <= 0 {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(tag = packet.type_tag(), "dropping packet with expired TTL");
            return false;
        }

        if packet.header().is_broadcast() {
            packet.header_mut().ttl -= 1;
            return match origin {
                // We are an endpoint, not a router: an inbound broadcast is
                // for us, never re-forwarded to the network
                PacketOrigin::Inbound => self.deliver_local(packet).await,
                PacketOrigin::Local => {
                    if (self.send_upstream)(packet).await {
                        self.stats.packets_broadcast.fetch_add(1, Ordering::Relaxed);
                        true
                    } else {
                        self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                }
            };
        }

        if packet.header().target_mud == self.mud_name {
            packet.header_mut().ttl -= 1;
            return self.deliver_local(packet).await;
        }

        self.route_remote(packet).await
    }

    async fn deliver_local(&self, packet: Packet) -> bool {
        if self.dispatcher.enqueue(packet).await {
            self.stats.packets_routed_local.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("dispatcher queue full, packet dropped");
            false
        }
    }

    async fn route_remote(&self, mut packet: Packet) -> bool {
        let target = packet.header().target_mud.clone();

        let mud = self.state.get_mud_info(&target).await;
        match mud {
            None => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target = %target, "unknown destination mud");
                let reply = Packet::error_reply(
                    &packet,
                    &self.mud_name,
                    "unk-dst",
                    "Unknown destination",
                );
                (self.send_upstream)(reply).await;
                false
            }
            Some(info) if info.status != MudStatus::Up => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target = %target, "destination mud is not up");
                let reply = Packet::error_reply(
                    &packet,
                    &self.mud_name,
                    "not-imp",
                    &format!("{} is not available", target),
                );
                (self.send_upstream)(reply).await;
                false
            }
            Some(_) => {
                packet.header_mut().ttl -= 1;
                if (self.send_upstream)(packet).await {
                    self.stats
                        .packets_routed_remote
                        .fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }
}
