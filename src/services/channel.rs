// Channel handling
//
// Messages, emotes and targeted emotes on I3 channels, plus the control
// packets that maintain channel membership. Access control is banned-set
// first, then admission for non-public channels.

use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::protocol::{Packet, PacketHeader, PacketType, BROADCAST, DEFAULT_TTL};
use crate::services::{SendPacket, Service, ServiceMetrics};
use crate::state::{ChannelInfo, StateManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Per-channel history window
const CHANNEL_HISTORY_LIMIT: usize = 20;

/// One remembered channel message
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub from_mud: String,
    pub from_user: String,
    pub visname: String,
    pub message: String,
    pub emote: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct ChannelService {
    state: Arc<StateManager>,
    send_packet: SendPacket,
    mud_name: String,
    events: EventBus,
    metrics: ServiceMetrics,
    history: Mutex<HashMap<String, VecDeque<ChannelRecord>>>,
}

impl ChannelService {
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
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Recent messages on a channel, oldest first
    pub fn channel_history(&self, channel: &str) -> Vec<ChannelRecord> {
        self.history
            .lock()
            .get(channel)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_history(&self, channel: &str, record: ChannelRecord) {
        let mut histories = self.history.lock();
        let history = histories.entry(channel.to_string()).or_default();
        history.push_back(record);
        while history.len() > CHANNEL_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Check channel existence and access; Some(error reply) on refusal
    async fn check_access(&self, packet: &Packet, channel: &str) -> Option<Packet> {
        match self.state.get_channel(channel).await {
            None => Some(Packet::error_reply(
                packet,
                &self.mud_name,
                "unk-channel",
                &format!("unknown channel: {}", channel),
            )),
            Some(info) if !info.can_access(&packet.header().originator_mud) => {
                Some(Packet::error_reply(
                    packet,
                    &self.mud_name,
                    "not-allowed",
                    &format!(
                        "{} may not use channel {}",
                        packet.header().originator_mud,
                        channel
                    ),
                ))
            }
            Some(_) => None,
        }
    }

    async fn handle_message(
        &self,
        packet: Packet,
        channel: String,
        visname: String,
        message: String,
        emote: bool,
    ) -> Option<Packet> {
        if let Some(error) = self.check_access(&packet, &channel).await {
            return Some(error);
        }

        let header = packet.header();
        self.state
            .with_channel_mut(&channel, |ch| ch.record_message())
            .await;
        self.record_history(
            &channel,
            ChannelRecord {
                from_mud: header.originator_mud.clone(),
                from_user: header.originator_user.clone(),
                visname: visname.clone(),
                message: message.clone(),
                emote,
                timestamp: Utc::now(),
            },
        );

        let event = if emote {
            GatewayEvent::ChannelEmote {
                channel,
                from_mud: header.originator_mud.clone(),
                from_user: header.originator_user.clone(),
                visname,
                message,
            }
        } else {
            GatewayEvent::ChannelMessage {
                channel,
                from_mud: header.originator_mud.clone(),
                from_user: header.originator_user.clone(),
                visname,
                message,
            }
        };
        self.events.emit(event);
        None
    }

    /// Local users listening on a channel right now
    pub async fn local_channel_users(&self, channel: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .state
            .online_sessions()
            .await
            .into_iter()
            .filter(|s| s.listening_channels.contains(channel))
            .map(|s| s.user_name)
            .collect();
        users.sort_by_key(|u| u.to_lowercase());
        users
    }

    /// Broadcast a channel message from a local user
    pub async fn send_channel_message(
        &self,
        from_user: &str,
        channel: &str,
        message: &str,
        emote: bool,
    ) -> bool {
        let accessible = self
            .state
            .get_channel(channel)
            .await
            .map(|ch| ch.can_access(&self.mud_name))
            .unwrap_or(false);
        if !accessible {
            return false;
        }

        let header = PacketHeader::new(DEFAULT_TTL, &self.mud_name, from_user, BROADCAST, "");
        let packet = if emote {
            Packet::ChannelEmote {
                header,
                channel: channel.to_string(),
                visname: from_user.to_string(),
                message: message.to_string(),
            }
        } else {
            Packet::ChannelMessage {
                header,
                channel: channel.to_string(),
                visname: from_user.to_string(),
                message: message.to_string(),
            }
        };
        let sent = (self.send_packet)(packet).await;
        if sent {
            self.state
                .with_channel_mut(channel, |ch| ch.record_message())
                .await;
            self.record_history(
                channel,
                ChannelRecord {
                    from_mud: self.mud_name.clone(),
                    from_user: from_user.to_string(),
                    visname: from_user.to_string(),
                    message: message.to_string(),
                    emote,
                    timestamp: Utc::now(),
                },
            );
        }
        sent
    }

    /// A local user joins a channel
    pub async fn join_channel(&self, session_id: &str, channel: &str, user: &str) -> bool {
        let known = self
            .state
            .with_channel_mut(channel, |ch| {
                ch.add_listener(&self.mud_name);
                ch.add_user(&self.mud_name, user);
            })
            .await;
        if !known {
            return false;
        }
        self.state
            .with_session_mut(session_id, |s| {
                s.listening_channels.insert(channel.to_string());
            })
            .await;
        self.events.emit(GatewayEvent::ChannelJoin {
            channel: channel.to_string(),
            mud: self.mud_name.clone(),
        });
        true
    }

    /// A local user leaves a channel
    pub async fn leave_channel(&self, session_id: &str, channel: &str, user: &str) -> bool {
        let known = self
            .state
            .with_channel_mut(channel, |ch| {
                ch.remove_user(&self.mud_name, user);
            })
            .await;
        if !known {
            return false;
        }
        self.state
            .with_session_mut(session_id, |s| {
                s.listening_channels.remove(channel);
            })
            .await;
        self.events.emit(GatewayEvent::ChannelLeave {
            channel: channel.to_string(),
            mud: self.mud_name.clone(),
        });
        true
    }
}

#[async_trait]
impl Service for ChannelService {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn packet_types(&self) -> Vec<PacketType> {
        vec![
            PacketType::ChannelM,
            PacketType::ChannelE,
            PacketType::ChannelT,
            PacketType::ChannelAdd,
            PacketType::ChannelRemove,
            PacketType::ChannelAdmin,
            PacketType::ChanlistReply,
            PacketType::ChannelListen,
            PacketType::ChannelWhoReq,
            PacketType::ChannelWhoReply,
        ]
    }

    async fn validate_packet(&self, packet: &Packet) -> bool {
        match packet {
            Packet::ChannelMessage { channel, message, .. }
            | Packet::ChannelEmote { channel, message, .. } => {
                !channel.is_empty() && !message.is_empty()
            }
            Packet::ChannelTarget { channel, .. }
            | Packet::ChannelAdd { channel, .. }
            | Packet::ChannelRemove { channel, .. }
            | Packet::ChannelAdmin { channel, .. }
            | Packet::ChannelListen { channel, .. }
            | Packet::ChannelWhoReq { channel, .. }
            | Packet::ChannelWhoReply { channel, .. } => !channel.is_empty(),
            Packet::ChanlistReply { .. } => true,
            _ => false,
        }
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        self.metrics.record_handled();
        match packet {
            Packet::ChannelMessage {
                ref channel,
                ref visname,
                ref message,
                ..
            } => {
                let (channel, visname, message) =
                    (channel.clone(), visname.clone(), message.clone());
                Ok(self
                    .handle_message(packet, channel, visname, message, false)
                    .await)
            }
            Packet::ChannelEmote {
                ref channel,
                ref visname,
                ref message,
                ..
            } => {
                let (channel, visname, message) =
                    (channel.clone(), visname.clone(), message.clone());
                Ok(self
                    .handle_message(packet, channel, visname, message, true)
                    .await)
            }
            Packet::ChannelTarget {
                ref channel,
                ref originator_visname,
                ref message_others,
                ..
            } => {
                let (channel, visname, message) = (
                    channel.clone(),
                    originator_visname.clone(),
                    message_others.clone(),
                );
                Ok(self
                    .handle_message(packet, channel, visname, message, true)
                    .await)
            }
            Packet::ChannelAdd {
                header,
                channel,
                channel_type,
            } => {
                let mut info = ChannelInfo::new(channel.clone());
                info.owner = header.originator_mud.clone();
                info.channel_type = channel_type;
                self.state.add_channel(info).await;
                debug!(channel = %channel, "channel added");
                Ok(None)
            }
            Packet::ChannelRemove { channel, .. } => {
                self.state.remove_channel(&channel).await;
                debug!(channel = %channel, "channel removed");
                Ok(None)
            }
            Packet::ChannelAdmin {
                channel,
                add_muds,
                remove_muds,
                ..
            } => {
                self.state
                    .with_channel_mut(&channel, |ch| {
                        for mud in &add_muds {
                            ch.admitted_muds.insert(mud.clone());
                        }
                        for mud in &remove_muds {
                            ch.admitted_muds.remove(mud);
                        }
                    })
                    .await;
                Ok(None)
            }
            Packet::ChanlistReply {
                chanlist_id,
                channels,
                ..
            } => {
                self.state.update_chanlist(&channels, chanlist_id).await;
                Ok(None)
            }
            Packet::ChannelListen { header, channel, on } => {
                self.state
                    .with_channel_mut(&channel, |ch| {
                        if on {
                            ch.add_listener(&header.originator_mud);
                        } else {
                            ch.remove_listener(&header.originator_mud);
                        }
                    })
                    .await;
                Ok(None)
            }
            Packet::ChannelWhoReq { header, channel } => {
                let users = self.local_channel_users(&channel).await;
                Ok(Some(Packet::ChannelWhoReply {
                    header: header.reply_to(&self.mud_name),
                    channel,
                    users,
                }))
            }
            Packet::ChannelWhoReply { channel, users, .. } => {
                debug!(channel = %channel, users = users.len(), "channel who reply");
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
    use crate::state::models::CHANNEL_SELECTIVE;

    struct Harness {
        service: ChannelService,
        state: Arc<StateManager>,
        sent: tokio::sync::mpsc::UnboundedReceiver<Packet>,
        events: tokio::sync::broadcast::Receiver<GatewayEvent>,
    }

    fn harness() -> Harness {
        let state = Arc::new(StateManager::new(None));
        let bus = EventBus::new();
        let events = bus.subscribe();
        let (tx, sent) = tokio::sync::mpsc::unbounded_channel();
        let send: SendPacket = Arc::new(move |packet| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(packet);
                true
            })
        });
        Harness {
            service: ChannelService::new(Arc::clone(&state), send, "TestMUD".to_string(), bus),
            state,
            sent,
            events,
        }
    }

    fn channel_message(channel: &str, from_mud: &str) -> Packet {
        Packet::ChannelMessage {
            header: PacketHeader::new(200, from_mud, "alice", BROADCAST, ""),
            channel: channel.to_string(),
            visname: "Alice".to_string(),
            message: "hello channel".to_string(),
        }
    }

    #[tokio::test]
    async fn test_message_on_known_channel() {
        let mut h = harness();
        h.state.add_channel(ChannelInfo::new("chat")).await;

        let reply = h
            .service
            .handle_packet(channel_message("chat", "RemoteMUD"))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(h.state.get_channel("chat").await.unwrap().message_count, 1);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            GatewayEvent::ChannelMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_message_on_unknown_channel() {
        let h = harness();
        let reply = h
            .service
            .handle_packet(channel_message("nochannel", "RemoteMUD"))
            .await
            .unwrap();
        match reply {
            Some(Packet::Error { error_code, .. }) => assert_eq!(error_code, "unk-channel"),
            other => panic!("expected unk-channel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_from_banned_mud() {
        let h = harness();
        let mut chat = ChannelInfo::new("chat");
        chat.banned_muds.insert("BadMud".to_string());
        h.state.add_channel(chat).await;

        let reply = h
            .service
            .handle_packet(channel_message("chat", "BadMud"))
            .await
            .unwrap();
        match reply {
            Some(Packet::Error { error_code, .. }) => assert_eq!(error_code, "not-allowed"),
            other => panic!("expected not-allowed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_selective_channel_requires_admission() {
        let h = harness();
        let mut chan = ChannelInfo::new("inner");
        chan.channel_type = CHANNEL_SELECTIVE;
        chan.admitted_muds.insert("GoodMud".to_string());
        h.state.add_channel(chan).await;

        let denied = h
            .service
            .handle_packet(channel_message("inner", "RemoteMUD"))
            .await
            .unwrap();
        assert!(matches!(denied, Some(Packet::Error { .. })));

        let allowed = h
            .service
            .handle_packet(channel_message("inner", "GoodMud"))
            .await
            .unwrap();
        assert!(allowed.is_none());
    }

    #[tokio::test]
    async fn test_channel_add_and_remove() {
        let h = harness();
        h.service
            .handle_packet(Packet::ChannelAdd {
                header: PacketHeader::new(200, "OwnerMud", "", "TestMUD", ""),
                channel: "newchan".to_string(),
                channel_type: 0,
            })
            .await
            .unwrap();
        let info = h.state.get_channel("newchan").await.unwrap();
        assert_eq!(info.owner, "OwnerMud");

        h.service
            .handle_packet(Packet::ChannelRemove {
                header: PacketHeader::new(200, "OwnerMud", "", "TestMUD", ""),
                channel: "newchan".to_string(),
            })
            .await
            .unwrap();
        assert!(h.state.get_channel("newchan").await.is_none());
    }

    #[tokio::test]
    async fn test_channel_admin_updates_admission() {
        let h = harness();
        let mut chan = ChannelInfo::new("inner");
        chan.admitted_muds.insert("OldMud".to_string());
        h.state.add_channel(chan).await;

        h.service
            .handle_packet(Packet::ChannelAdmin {
                header: PacketHeader::new(200, "OwnerMud", "", "TestMUD", ""),
                channel: "inner".to_string(),
                add_muds: vec!["NewMud".to_string()],
                remove_muds: vec!["OldMud".to_string()],
            })
            .await
            .unwrap();

        let info = h.state.get_channel("inner").await.unwrap();
        assert!(info.admitted_muds.contains("NewMud"));
        assert!(!info.admitted_muds.contains("OldMud"));
    }

    #[tokio::test]
    async fn test_listen_packet_updates_listeners() {
        let h = harness();
        h.state.add_channel(ChannelInfo::new("chat")).await;

        h.service
            .handle_packet(Packet::ChannelListen {
                header: PacketHeader::new(200, "RemoteMUD", "", "TestMUD", ""),
                channel: "chat".to_string(),
                on: true,
            })
            .await
            .unwrap();
        assert!(h
            .state
            .get_channel("chat")
            .await
            .unwrap()
            .listening_muds
            .contains("RemoteMUD"));

        h.service
            .handle_packet(Packet::ChannelListen {
                header: PacketHeader::new(200, "RemoteMUD", "", "TestMUD", ""),
                channel: "chat".to_string(),
                on: false,
            })
            .await
            .unwrap();
        assert!(!h
            .state
            .get_channel("chat")
            .await
            .unwrap()
            .listening_muds
            .contains("RemoteMUD"));
    }

    #[tokio::test]
    async fn test_channel_who_reply_lists_local_listeners() {
        let h = harness();
        h.state.add_channel(ChannelInfo::new("chat")).await;
        let session = h.state.create_session("TestMUD", "bob").await;
        h.service.join_channel(&session.session_id, "chat", "bob").await;

        let reply = h
            .service
            .handle_packet(Packet::ChannelWhoReq {
                header: PacketHeader::new(200, "RemoteMUD", "asker", "TestMUD", ""),
                channel: "chat".to_string(),
            })
            .await
            .unwrap();

        match reply {
            Some(Packet::ChannelWhoReply { channel, users, header }) => {
                assert_eq!(channel, "chat");
                assert_eq!(users, vec!["bob".to_string()]);
                assert_eq!(header.target_mud, "RemoteMUD");
            }
            other => panic!("expected channel-who-reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_and_leave_channel() {
        let h = harness();
        h.state.add_channel(ChannelInfo::new("chat")).await;
        let session = h.state.create_session("TestMUD", "bob").await;

        assert!(h.service.join_channel(&session.session_id, "chat", "bob").await);
        let info = h.state.get_channel("chat").await.unwrap();
        assert!(info.listening_muds.contains("TestMUD"));
        assert!(info.active_users.get("TestMUD").unwrap().contains("bob"));

        assert!(h.service.leave_channel(&session.session_id, "chat", "bob").await);
        let info = h.state.get_channel("chat").await.unwrap();
        assert!(info.active_users.is_empty());

        // Joining a channel the router never announced fails
        assert!(!h.service.join_channel(&session.session_id, "ghost", "bob").await);
    }

    #[tokio::test]
    async fn test_send_channel_message_checks_access() {
        let mut h = harness();
        // No such channel yet
        assert!(!h.service.send_channel_message("bob", "chat", "hi", false).await);

        h.state.add_channel(ChannelInfo::new("chat")).await;
        assert!(h.service.send_channel_message("bob", "chat", "hi", false).await);

        match h.sent.try_recv().unwrap() {
            Packet::ChannelMessage { header, channel, .. } => {
                assert!(header.is_broadcast());
                assert_eq!(channel, "chat");
            }
            other => panic!("expected channel message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chanlist_reply_updates_store() {
        let h = harness();
        h.service
            .handle_packet(Packet::ChanlistReply {
                header: PacketHeader::new(200, "*i3", "", "TestMUD", ""),
                chanlist_id: 9,
                channels: vec![crate::protocol::ChanlistEntry {
                    name: "imud_gossip".to_string(),
                    info: Some(("*i3".to_string(), 0)),
                }],
            })
            .await
            .unwrap();
        assert_eq!(h.state.chanlist_id().await, 9);
        assert!(h.state.get_channel("imud_gossip").await.is_some());
    }
}
