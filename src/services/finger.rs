// Finger handling
//
// Detailed information about a single local user, assembled from the
// session profile; fields without a value are simply omitted from the
// reply mapping.

use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::network::lpc::LpcValue;
use crate::protocol::{Packet, PacketHeader, PacketType, DEFAULT_TTL};
use crate::services::{PendingRequests, SendPacket, Service, ServiceMetrics};
use crate::state::{StateManager, UserSession};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FINGER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FingerService {
    state: Arc<StateManager>,
    send_packet: SendPacket,
    mud_name: String,
    events: EventBus,
    metrics: ServiceMetrics,
    pending: PendingRequests<Vec<(LpcValue, LpcValue)>>,
}

impl FingerService {
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
            pending: PendingRequests::new(),
        }
    }

    fn user_info(session: &UserSession) -> Vec<(LpcValue, LpcValue)> {
        let mut info = vec![(
            LpcValue::string("name"),
            LpcValue::string(session.user_name.clone()),
        )];

        let profile = &session.profile;
        let optional_strings = [
            ("title", &profile.title),
            ("real_name", &profile.real_name),
            ("email", &profile.email),
            ("class", &profile.char_class),
            ("race", &profile.race),
            ("plan", &profile.plan),
        ];
        for (key, value) in optional_strings {
            if let Some(v) = value {
                info.push((LpcValue::string(key), LpcValue::string(v.clone())));
            }
        }
        if let Some(level) = profile.level {
            info.push((LpcValue::string("level"), LpcValue::Int(level)));
        }
        if let Some(last_login) = profile.last_login {
            info.push((
                LpcValue::string("last_login"),
                LpcValue::string(last_login.to_rfc3339()),
            ));
        }
        info.push((
            LpcValue::string("idle"),
            LpcValue::Int(session.idle_seconds() as i32),
        ));
        info
    }

    /// Finger a user on a remote mud, waiting for the correlated reply
    pub async fn finger_user(
        &self,
        from_user: &str,
        target_mud: &str,
        target_user: &str,
    ) -> Option<Vec<(LpcValue, LpcValue)>> {
        let packet = Packet::FingerReq {
            header: PacketHeader::new(DEFAULT_TTL, &self.mud_name, from_user, target_mud, ""),
            target_user: target_user.to_string(),
        };
        if !(self.send_packet)(packet).await {
            return None;
        }
        let key = format!("{}:{}", from_user, target_mud);
        self.pending.wait(&key, FINGER_REPLY_TIMEOUT).await
    }
}

#[async_trait]
impl Service for FingerService {
    fn name(&self) -> &'static str {
        "finger"
    }

    fn packet_types(&self) -> Vec<PacketType> {
        vec![PacketType::FingerReq, PacketType::FingerReply]
    }

    async fn validate_packet(&self, packet: &Packet) -> bool {
        match packet {
            Packet::FingerReq { target_user, .. } => !target_user.is_empty(),
            Packet::FingerReply { .. } => true,
            _ => false,
        }
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        self.metrics.record_handled();
        match packet {
            Packet::FingerReq {
                header,
                target_user,
            } => {
                self.events.emit(GatewayEvent::FingerRequest {
                    from_mud: header.originator_mud.clone(),
                    from_user: header.originator_user.clone(),
                    target_user: target_user.clone(),
                });

                match self.state.find_session_by_user(&target_user).await {
                    Some(session) => Ok(Some(Packet::FingerReply {
                        header: header.reply_to(&self.mud_name),
                        user_info: Self::user_info(&session),
                    })),
                    None => Ok(Some(Packet::error_reply(
                        &Packet::FingerReq {
                            header,
                            target_user: target_user.clone(),
                        },
                        &self.mud_name,
                        "unk-user",
                        &format!("no such user: {}", target_user),
                    ))),
                }
            }
            Packet::FingerReply { header, user_info } => {
                debug!(from = %header.originator_mud, "finger reply received");
                let key = format!("{}:{}", header.target_user, header.originator_mud);
                self.pending.complete(&key, user_info);
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
        service: FingerService,
        state: Arc<StateManager>,
    }

    fn harness() -> Harness {
        let state = Arc::new(StateManager::new(None));
        let send: SendPacket = Arc::new(|_| Box::pin(async { true }));
        Harness {
            service: FingerService::new(
                Arc::clone(&state),
                send,
                "TestMUD".to_string(),
                EventBus::new(),
            ),
            state,
        }
    }

    fn finger_req(target: &str) -> Packet {
        Packet::FingerReq {
            header: PacketHeader::new(200, "RemoteMUD", "asker", "TestMUD", ""),
            target_user: target.to_string(),
        }
    }

    #[tokio::test]
    async fn test_finger_known_user() {
        let h = harness();
        let session = h.state.create_session("TestMUD", "bob").await;
        h.state
            .with_session_mut(&session.session_id, |s| {
                s.profile.title = Some("the Mighty".to_string());
                s.profile.level = Some(45);
            })
            .await;

        let reply = h.service.handle_packet(finger_req("bob")).await.unwrap();
        match reply {
            Some(Packet::FingerReply { user_info, header }) => {
                assert_eq!(header.target_mud, "RemoteMUD");
                let mapping = LpcValue::Mapping(user_info);
                assert_eq!(mapping.get("name").and_then(|v| v.as_str()), Some("bob"));
                assert_eq!(
                    mapping.get("title").and_then(|v| v.as_str()),
                    Some("the Mighty")
                );
                assert_eq!(mapping.get("level").and_then(|v| v.as_int()), Some(45));
                // Absent profile fields are omitted entirely
                assert!(mapping.get("email").is_none());
                assert!(mapping.get("plan").is_none());
            }
            other => panic!("expected finger-reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finger_unknown_user() {
        let h = harness();
        let reply = h.service.handle_packet(finger_req("ghost")).await.unwrap();
        match reply {
            Some(Packet::Error { error_code, header, .. }) => {
                assert_eq!(error_code, "unk-user");
                assert_eq!(header.target_mud, "RemoteMUD");
            }
            other => panic!("expected unk-user, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_requires_target() {
        let h = harness();
        assert!(h.service.validate_packet(&finger_req("bob")).await);
        assert!(!h.service.validate_packet(&finger_req("")).await);
    }

    #[tokio::test]
    async fn test_reply_correlation() {
        let h = harness();
        let service = Arc::new(h.service);

        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.finger_user("alice", "FarMud", "zed").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        service
            .handle_packet(Packet::FingerReply {
                header: PacketHeader::new(200, "FarMud", "", "TestMUD", "alice"),
                user_info: vec![(LpcValue::string("name"), LpcValue::string("zed"))],
            })
            .await
            .unwrap();

        let info = waiter.await.unwrap().unwrap();
        assert_eq!(
            LpcValue::Mapping(info).get("name").and_then(|v| v.as_str()),
            Some("zed")
        );
    }
}
