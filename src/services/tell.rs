// Tell and emoteto handling
//
// Direct user-to-user messages. Delivery to a local user records the sender
// for reply addressing and keeps a short rolling history per recipient;
// unknown or offline recipients get an unk-user error back.

use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::protocol::{Packet, PacketHeader, PacketType, DEFAULT_TTL};
use crate::services::{SendPacket, Service, ServiceMetrics};
use crate::state::StateManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Per-recipient history window
const TELL_HISTORY_LIMIT: usize = 20;

/// One remembered tell for a local recipient
#[derive(Debug, Clone)]
pub struct TellRecord {
    pub from_mud: String,
    pub from_user: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct TellService {
    state: Arc<StateManager>,
    send_packet: SendPacket,
    mud_name: String,
    events: EventBus,
    metrics: ServiceMetrics,
    /// recipient -> "mud:user" of the most recent sender
    recent_tells: Mutex<HashMap<String, String>>,
    tell_history: Mutex<HashMap<String, VecDeque<TellRecord>>>,
}

impl TellService {
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
            recent_tells: Mutex::new(HashMap::new()),
            tell_history: Mutex::new(HashMap::new()),
        }
    }

    /// Who last sent a tell to this user, as "mud:user"
    pub fn last_tell_sender(&self, user: &str) -> Option<String> {
        self.recent_tells.lock().get(user).cloned()
    }

    pub fn tell_history(&self, user: &str) -> Vec<TellRecord> {
        self.tell_history
            .lock()
            .get(user)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_delivery(&self, to_user: &str, from_mud: &str, from_user: &str, message: &str) {
        self.recent_tells
            .lock()
            .insert(to_user.to_string(), format!("{}:{}", from_mud, from_user));

        let mut histories = self.tell_history.lock();
        let history = histories.entry(to_user.to_string()).or_default();
        history.push_back(TellRecord {
            from_mud: from_mud.to_string(),
            from_user: from_user.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        while history.len() > TELL_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    async fn deliver(&self, original: &Packet) -> Option<Packet> {
        let (packet_type, header, visname, message) = match original {
            Packet::Tell { header, visname, message } => {
                (PacketType::Tell, header, visname, message)
            }
            Packet::Emoteto { header, visname, message } => {
                (PacketType::Emoteto, header, visname, message)
            }
            _ => return None,
        };

        let session = self.state.find_session_by_user(&header.target_user).await;

        let Some(session) = session.filter(|s| s.online) else {
            return Some(Packet::error_reply(
                original,
                &self.mud_name,
                "unk-user",
                &format!("{} is not online", header.target_user),
            ));
        };

        if session.is_blocked(&header.originator_mud, &header.originator_user) {
            debug!(
                from = %header.originator_user,
                to = %header.target_user,
                "tell suppressed by block list"
            );
            return None;
        }

        self.record_delivery(
            &header.target_user,
            &header.originator_mud,
            &header.originator_user,
            message,
        );
        self.state
            .with_session_mut(&session.session_id, |s| {
                s.messages_received += 1;
                s.update_activity();
            })
            .await;

        let event = match packet_type {
            PacketType::Emoteto => GatewayEvent::EmotetoReceived {
                from_mud: header.originator_mud.clone(),
                from_user: header.originator_user.clone(),
                to_user: header.target_user.clone(),
                visname: visname.to_string(),
                message: message.to_string(),
            },
            _ => GatewayEvent::TellReceived {
                from_mud: header.originator_mud.clone(),
                from_user: header.originator_user.clone(),
                to_user: header.target_user.clone(),
                visname: visname.to_string(),
                message: message.to_string(),
            },
        };
        self.events.emit(event);
        None
    }

    /// Send a tell from a local user to a remote one
    pub async fn send_tell(
        &self,
        from_user: &str,
        to_user: &str,
        to_mud: &str,
        message: &str,
        visname: Option<&str>,
    ) -> bool {
        let packet = Packet::Tell {
            header: PacketHeader::new(DEFAULT_TTL, &self.mud_name, from_user, to_mud, to_user),
            visname: visname.unwrap_or(from_user).to_string(),
            message: message.to_string(),
        };
        (self.send_packet)(packet).await
    }

    /// Send an emoteto from a local user to a remote one
    pub async fn send_emoteto(
        &self,
        from_user: &str,
        to_user: &str,
        to_mud: &str,
        message: &str,
        visname: Option<&str>,
    ) -> bool {
        let packet = Packet::Emoteto {
            header: PacketHeader::new(DEFAULT_TTL, &self.mud_name, from_user, to_mud, to_user),
            visname: visname.unwrap_or(from_user).to_string(),
            message: message.to_string(),
        };
        (self.send_packet)(packet).await
    }
}

#[async_trait]
impl Service for TellService {
    fn name(&self) -> &'static str {
        "tell"
    }

    fn packet_types(&self) -> Vec<PacketType> {
        vec![PacketType::Tell, PacketType::Emoteto]
    }

    async fn validate_packet(&self, packet: &Packet) -> bool {
        match packet {
            Packet::Tell { header, message, .. } | Packet::Emoteto { header, message, .. } => {
                !header.originator_user.is_empty()
                    && !header.target_user.is_empty()
                    && !message.is_empty()
            }
            _ => false,
        }
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        self.metrics.record_handled();
        Ok(self.deliver(&packet).await)
    }

    fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        service: TellService,
        sent: tokio::sync::mpsc::UnboundedReceiver<Packet>,
        state: Arc<StateManager>,
    }

    fn harness() -> Harness {
        let state = Arc::new(StateManager::new(None));
        let (tx, sent) = tokio::sync::mpsc::unbounded_channel();
        let send: SendPacket = Arc::new(move |packet| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(packet);
                true
            })
        });
        Harness {
            service: TellService::new(
                Arc::clone(&state),
                send,
                "TestMUD".to_string(),
                EventBus::new(),
            ),
            sent,
            state,
        }
    }

    fn tell(from: &str, to: &str, message: &str) -> Packet {
        Packet::Tell {
            header: PacketHeader::new(200, "RemoteMUD", from, "TestMUD", to),
            visname: from.to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_tell_to_online_user() {
        let h = harness();
        h.state.create_session("TestMUD", "bob").await;

        let reply = h.service.handle_packet(tell("alice", "bob", "hey")).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(
            h.service.last_tell_sender("bob"),
            Some("RemoteMUD:alice".to_string())
        );
        let history = h.service.tell_history("bob");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hey");
        assert_eq!(h.service.metrics().handled(), 1);
    }

    #[tokio::test]
    async fn test_tell_to_offline_user() {
        let h = harness();
        let reply = h.service.handle_packet(tell("alice", "bob", "hey")).await.unwrap();
        match reply {
            Some(Packet::Error {
                header,
                error_code,
                error_message,
                ..
            }) => {
                assert_eq!(error_code, "unk-user");
                assert!(error_message.contains("not online"));
                assert_eq!(header.target_mud, "RemoteMUD");
                assert_eq!(header.target_user, "alice");
            }
            other => panic!("expected unk-user error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_window_is_capped() {
        let h = harness();
        h.state.create_session("TestMUD", "bob").await;

        for i in 0..25 {
            h.service
                .handle_packet(tell(&format!("sender{}", i), "bob", &format!("Message {}", i)))
                .await
                .unwrap();
        }

        let history = h.service.tell_history("bob");
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].message, "Message 5");
        assert_eq!(history[19].message, "Message 24");
    }

    #[tokio::test]
    async fn test_recent_tells_tracks_latest_sender() {
        let h = harness();
        h.state.create_session("TestMUD", "bob").await;

        h.service.handle_packet(tell("alice", "bob", "first")).await.unwrap();
        assert_eq!(
            h.service.last_tell_sender("bob"),
            Some("RemoteMUD:alice".to_string())
        );

        h.service.handle_packet(tell("carol", "bob", "second")).await.unwrap();
        assert_eq!(
            h.service.last_tell_sender("bob"),
            Some("RemoteMUD:carol".to_string())
        );
    }

    #[tokio::test]
    async fn test_blocked_sender_dropped_silently() {
        let h = harness();
        let session = h.state.create_session("TestMUD", "bob").await;
        h.state
            .with_session_mut(&session.session_id, |s| s.block_user("RemoteMUD", "alice"))
            .await;

        let reply = h.service.handle_packet(tell("alice", "bob", "hey")).await.unwrap();
        assert!(reply.is_none());
        // Nothing recorded for a suppressed tell
        assert!(h.service.last_tell_sender("bob").is_none());
    }

    #[tokio::test]
    async fn test_validation_rules() {
        let h = harness();
        assert!(h.service.validate_packet(&tell("alice", "bob", "hi")).await);
        assert!(!h.service.validate_packet(&tell("", "bob", "hi")).await);
        assert!(!h.service.validate_packet(&tell("alice", "", "hi")).await);
        assert!(!h.service.validate_packet(&tell("alice", "bob", "")).await);

        let wrong_type = Packet::LocateReq {
            header: PacketHeader::default(),
            user_to_locate: "x".to_string(),
        };
        assert!(!h.service.validate_packet(&wrong_type).await);
    }

    #[tokio::test]
    async fn test_send_tell_builds_packet() {
        let mut h = harness();
        assert!(
            h.service
                .send_tell("alice", "bob", "RemoteMUD", "Hello Bob!", Some("Alice"))
                .await
        );

        match h.sent.try_recv().unwrap() {
            Packet::Tell {
                header,
                visname,
                message,
            } => {
                assert_eq!(header.originator_mud, "TestMUD");
                assert_eq!(header.originator_user, "alice");
                assert_eq!(header.target_mud, "RemoteMUD");
                assert_eq!(header.target_user, "bob");
                assert_eq!(visname, "Alice");
                assert_eq!(message, "Hello Bob!");
            }
            other => panic!("expected tell, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_tell_visname_defaults_to_sender() {
        let mut h = harness();
        h.service
            .send_emoteto("alice", "bob", "RemoteMUD", "waves.", None)
            .await;
        match h.sent.try_recv().unwrap() {
            Packet::Emoteto { visname, .. } => assert_eq!(visname, "alice"),
            other => panic!("expected emoteto, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tell_emits_event() {
        let state = Arc::new(StateManager::new(None));
        state.create_session("TestMUD", "bob").await;
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let send: SendPacket = Arc::new(|_| Box::pin(async { true }));
        let service = TellService::new(state, send, "TestMUD".to_string(), events);

        service.handle_packet(tell("alice", "bob", "hey")).await.unwrap();
        match rx.try_recv().unwrap() {
            GatewayEvent::TellReceived { from_user, to_user, .. } => {
                assert_eq!(from_user, "alice");
                assert_eq!(to_user, "bob");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
