// Locate handling
//
// Finds which mud a user is on. Broadcast requests only answer when the
// user is here; direct requests always answer, with empty fields on a miss.
// Positive results are cached briefly; negatives never are.

use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::protocol::{Packet, PacketHeader, PacketType, BROADCAST, DEFAULT_TTL};
use crate::services::{PendingRequests, SendPacket, Service, ServiceMetrics};
use crate::state::{StateManager, TtlCache};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const LOCATE_CACHE_TTL: Duration = Duration::from_secs(30);
const LOCATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a locate, as delivered to waiters and the cache
#[derive(Debug, Clone, PartialEq)]
pub struct LocateResult {
    pub found: bool,
    pub mud: String,
    pub user: String,
    pub idle_time: i32,
    pub status: String,
}

impl LocateResult {
    fn not_found() -> Self {
        Self {
            found: false,
            mud: String::new(),
            user: String::new(),
            idle_time: 0,
            status: String::new(),
        }
    }
}

pub struct LocateService {
    state: Arc<StateManager>,
    send_packet: SendPacket,
    mud_name: String,
    events: EventBus,
    metrics: ServiceMetrics,
    locate_cache: TtlCache<LocateResult>,
    pending: PendingRequests<LocateResult>,
}

impl LocateService {
    pub fn new(
        state: Arc<StateManager>,
        send_packet: SendPacket,
        mud_name: String,
        events: EventBus,
    ) -> Self {
        Self {
            state,
            send_packet,
            mud_name,
            events,
            metrics: ServiceMetrics::default(),
            locate_cache: TtlCache::new(LOCATE_CACHE_TTL),
            pending: PendingRequests::new(),
        }
    }

    /// Locate a user somewhere on the network. Broadcasts a request and
    /// waits up to the timeout; None when nobody answered or the user is
    /// not online anywhere.
    pub async fn locate_user(
        &self,
        from_user: &str,
        user: &str,
        timeout: Option<Duration>,
    ) -> Option<LocateResult> {
        let cache_key = user.to_lowercase();
        if let Some(cached) = self.locate_cache.get(&cache_key) {
            return Some(cached);
        }

        let packet = Packet::LocateReq {
            header: PacketHeader::new(DEFAULT_TTL, &self.mud_name, from_user, BROADCAST, ""),
            user_to_locate: user.to_string(),
        };
        if !(self.send_packet)(packet).await {
            return None;
        }

        let key = format!("{}:{}", from_user, cache_key);
        let result = self
            .pending
            .wait(&key, timeout.unwrap_or(LOCATE_TIMEOUT))
            .await;
        result.filter(|r| r.found)
    }
}

#[async_trait]
impl Service for LocateService {
    fn name(&self) -> &'static str {
        "locate"
    }

    fn packet_types(&self) -> Vec<PacketType> {
        vec![PacketType::LocateReq, PacketType::LocateReply]
    }

    async fn validate_packet(&self, packet: &Packet) -> bool {
        match packet {
            Packet::LocateReq { user_to_locate, .. } => !user_to_locate.is_empty(),
            Packet::LocateReply { .. } => true,
            _ => false,
        }
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        self.metrics.record_handled();
        match packet {
            Packet::LocateReq {
                header,
                user_to_locate,
            } => {
                self.events.emit(GatewayEvent::LocateRequest {
                    from_mud: header.originator_mud.clone(),
                    from_user: header.originator_user.clone(),
                    target_user: user_to_locate.clone(),
                });

                let session = self
                    .state
                    .find_session_by_user(&user_to_locate)
                    .await
                    .filter(|s| s.online);

                match session {
                    Some(session) => Ok(Some(Packet::LocateReply {
                        header: header.reply_to(&self.mud_name),
                        located_mud: self.mud_name.clone(),
                        located_user: session.user_name.clone(),
                        idle_time: session.idle_seconds() as i32,
                        status_string: session
                            .profile
                            .status_message
                            .clone()
                            .unwrap_or_default(),
                    })),
                    // A broadcast probe stays silent on a miss; a direct
                    // question always gets an answer
                    None if header.is_broadcast() => Ok(None),
                    None => Ok(Some(Packet::LocateReply {
                        header: header.reply_to(&self.mud_name),
                        located_mud: String::new(),
                        located_user: String::new(),
                        idle_time: 0,
                        status_string: String::new(),
                    })),
                }
            }
            Packet::LocateReply {
                header,
                located_mud,
                located_user,
                idle_time,
                status_string,
            } => {
                debug!(
                    user = %located_user,
                    mud = %located_mud,
                    "locate reply received"
                );
                let result = if located_mud.is_empty() {
                    LocateResult::not_found()
                } else {
                    LocateResult {
                        found: true,
                        mud: located_mud,
                        user: located_user,
                        idle_time,
                        status: status_string,
                    }
                };

                if result.found {
                    self.locate_cache
                        .set(result.user.to_lowercase(), result.clone());
                }
                let key = format!(
                    "{}:{}",
                    header.target_user,
                    result.user.to_lowercase()
                );
                self.pending.complete(&key, result);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        service: LocateService,
        state: Arc<StateManager>,
    }

    fn harness() -> Harness {
        let state = Arc::new(StateManager::new(None));
        let send: SendPacket = Arc::new(|_| Box::pin(async { true }));
        Harness {
            service: LocateService::new(
                Arc::clone(&state),
                send,
                "TestMUD".to_string(),
                EventBus::new(),
            ),
            state,
        }
    }

    fn locate_req(target_mud: &str, user: &str) -> Packet {
        Packet::LocateReq {
            header: PacketHeader::new(200, "RemoteMUD", "requester", target_mud, ""),
            user_to_locate: user.to_string(),
        }
    }

    #[tokio::test]
    async fn test_locate_user_found_locally() {
        let h = harness();
        let session = h.state.create_session("TestMUD", "testuser").await;
        h.state
            .with_session_mut(&session.session_id, |s| {
                s.profile.status_message = Some("Testing the system".to_string());
            })
            .await;

        let reply = h
            .service
            .handle_packet(locate_req(BROADCAST, "testuser"))
            .await
            .unwrap();
        match reply {
            Some(Packet::LocateReply {
                header,
                located_mud,
                located_user,
                status_string,
                idle_time,
            }) => {
                assert_eq!(header.target_mud, "RemoteMUD");
                assert_eq!(header.target_user, "requester");
                assert_eq!(located_mud, "TestMUD");
                assert_eq!(located_user, "testuser");
                assert_eq!(status_string, "Testing the system");
                assert!(idle_time >= 0);
            }
            other => panic!("expected locate-reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_miss_is_silent() {
        let h = harness();
        let reply = h
            .service
            .handle_packet(locate_req(BROADCAST, "ghost"))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_direct_miss_replies_empty() {
        let h = harness();
        let reply = h
            .service
            .handle_packet(locate_req("TestMUD", "ghost"))
            .await
            .unwrap();
        match reply {
            Some(Packet::LocateReply {
                located_mud,
                located_user,
                idle_time,
                ..
            }) => {
                assert_eq!(located_mud, "");
                assert_eq!(located_user, "");
                assert_eq!(idle_time, 0);
            }
            other => panic!("expected empty locate-reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let h = harness();
        h.state.create_session("TestMUD", "TestUser").await;

        let reply = h
            .service
            .handle_packet(locate_req(BROADCAST, "testuser"))
            .await
            .unwrap();
        match reply {
            Some(Packet::LocateReply { located_user, .. }) => {
                assert_eq!(located_user, "TestUser");
            }
            other => panic!("expected locate-reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_user_not_located() {
        let h = harness();
        let session = h.state.create_session("TestMUD", "sleeper").await;
        h.state
            .with_session_mut(&session.session_id, |s| s.online = false)
            .await;

        let reply = h
            .service
            .handle_packet(locate_req(BROADCAST, "sleeper"))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_positive_reply_populates_cache() {
        let h = harness();
        h.service
            .handle_packet(Packet::LocateReply {
                header: PacketHeader::new(200, "FarMud", "", "TestMUD", "requester"),
                located_mud: "FarMud".to_string(),
                located_user: "zed".to_string(),
                idle_time: 5,
                status_string: String::new(),
            })
            .await
            .unwrap();

        let cached = h.service.locate_cache.get("zed").unwrap();
        assert!(cached.found);
        assert_eq!(cached.mud, "FarMud");
    }

    #[tokio::test]
    async fn test_negative_reply_not_cached() {
        let h = harness();
        h.service
            .handle_packet(Packet::LocateReply {
                header: PacketHeader::new(200, "FarMud", "", "TestMUD", "requester"),
                located_mud: String::new(),
                located_user: String::new(),
                idle_time: 0,
                status_string: String::new(),
            })
            .await
            .unwrap();
        assert!(h.service.locate_cache.is_empty());
    }

    #[tokio::test]
    async fn test_locate_user_waits_for_reply() {
        let h = harness();
        let service = Arc::new(h.service);

        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .locate_user("requester", "zed", Some(Duration::from_secs(2)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        service
            .handle_packet(Packet::LocateReply {
                header: PacketHeader::new(200, "FarMud", "", "TestMUD", "requester"),
                located_mud: "FarMud".to_string(),
                located_user: "zed".to_string(),
                idle_time: 0,
                status_string: String::new(),
            })
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.mud, "FarMud");
    }

    #[tokio::test]
    async fn test_locate_user_timeout_returns_none() {
        let h = harness();
        let result = h
            .service
            .locate_user("requester", "nobody", Some(Duration::from_millis(30)))
            .await;
        assert!(result.is_none());
        // A timeout leaves the cache untouched
        assert!(h.service.locate_cache.is_empty());
    }
}
