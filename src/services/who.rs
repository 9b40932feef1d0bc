// Who handling
//
// Answers who-req with the locally online users, filtered by the request's
// criteria mapping and sorted by name. Results are cached per requester for
// a short window since some muds poll aggressively.

use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::network::lpc::LpcValue;
use crate::protocol::{Packet, PacketHeader, PacketType, DEFAULT_TTL};
use crate::services::{PendingRequests, SendPacket, Service, ServiceMetrics};
use crate::state::{StateManager, TtlCache, UserSession};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const WHO_CACHE_TTL: Duration = Duration::from_secs(30);
const WHO_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed who-req filter criteria; absent keys do not filter
#[derive(Debug, Default, Clone)]
struct WhoFilter {
    level_min: Option<i32>,
    level_max: Option<i32>,
    race: Option<String>,
    guild: Option<String>,
}

impl WhoFilter {
    fn from_mapping(pairs: &[(LpcValue, LpcValue)]) -> Self {
        let mut filter = WhoFilter::default();
        for (key, value) in pairs {
            match key.as_str() {
                Some("level_min") => filter.level_min = value.as_int(),
                Some("level_max") => filter.level_max = value.as_int(),
                Some("race") => filter.race = value.as_str().map(str::to_string),
                Some("guild") => filter.guild = value.as_str().map(str::to_string),
                _ => {}
            }
        }
        filter
    }

    fn matches(&self, session: &UserSession) -> bool {
        if let Some(min) = self.level_min {
            match session.profile.level {
                Some(level) if level >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.level_max {
            match session.profile.level {
                Some(level) if level <= max => {}
                _ => return false,
            }
        }
        if let Some(ref race) = self.race {
            if session.profile.race.as_deref() != Some(race.as_str()) {
                return false;
            }
        }
        if let Some(ref guild) = self.guild {
            if session.profile.guild.as_deref() != Some(guild.as_str()) {
                return false;
            }
        }
        true
    }
}

pub struct WhoService {
    state: Arc<StateManager>,
    send_packet: SendPacket,
    mud_name: String,
    events: EventBus,
    metrics: ServiceMetrics,
    who_cache: TtlCache<Vec<LpcValue>>,
    pending: PendingRequests<Vec<LpcValue>>,
}

impl WhoService {
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
            who_cache: TtlCache::new(WHO_CACHE_TTL),
            pending: PendingRequests::new(),
        }
    }

    fn session_entry(session: &UserSession) -> LpcValue {
        let mut pairs = vec![
            (
                LpcValue::string("name"),
                LpcValue::string(session.user_name.clone()),
            ),
            (
                LpcValue::string("idle"),
                LpcValue::Int(session.idle_seconds() as i32),
            ),
        ];
        if let Some(level) = session.profile.level {
            pairs.push((LpcValue::string("level"), LpcValue::Int(level)));
        }
        if let Some(ref race) = session.profile.race {
            pairs.push((LpcValue::string("race"), LpcValue::string(race.clone())));
        }
        if let Some(ref guild) = session.profile.guild {
            pairs.push((LpcValue::string("guild"), LpcValue::string(guild.clone())));
        }
        if let Some(ref title) = session.profile.title {
            pairs.push((LpcValue::string("extra"), LpcValue::string(title.clone())));
        }
        LpcValue::Mapping(pairs)
    }

    async fn build_who_data(&self, filter: &WhoFilter) -> Vec<LpcValue> {
        let mut sessions: Vec<UserSession> = self
            .state
            .online_sessions()
            .await
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect();
        sessions.sort_by_key(|s| s.user_name.to_lowercase());
        sessions.iter().map(Self::session_entry).collect()
    }

    /// Ask a remote mud who is on, waiting for the correlated reply
    pub async fn who_request(
        &self,
        from_user: &str,
        target_mud: &str,
        filter: Vec<(LpcValue, LpcValue)>,
    ) -> Option<Vec<LpcValue>> {
        let packet = Packet::WhoReq {
            header: PacketHeader::new(DEFAULT_TTL, &self.mud_name, from_user, target_mud, ""),
            filter,
        };
        if !(self.send_packet)(packet).await {
            return None;
        }
        let key = format!("{}:{}", from_user, target_mud);
        self.pending.wait(&key, WHO_REPLY_TIMEOUT).await
    }
}

#[async_trait]
impl Service for WhoService {
    fn name(&self) -> &'static str {
        "who"
    }

    fn packet_types(&self) -> Vec<PacketType> {
        vec![PacketType::WhoReq, PacketType::WhoReply]
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        self.metrics.record_handled();
        match packet {
            Packet::WhoReq { header, filter } => {
                self.events.emit(GatewayEvent::WhoRequest {
                    from_mud: header.originator_mud.clone(),
                    from_user: header.originator_user.clone(),
                });

                let cache_key = format!(
                    "who:{}:{}",
                    header.originator_mud, header.originator_user
                );
                let who_data = match self.who_cache.get(&cache_key) {
                    Some(cached) => cached,
                    None => {
                        let built = self
                            .build_who_data(&WhoFilter::from_mapping(&filter))
                            .await;
                        self.who_cache.set(cache_key, built.clone());
                        built
                    }
                };

                Ok(Some(Packet::WhoReply {
                    header: header.reply_to(&self.mud_name),
                    who_data,
                }))
            }
            Packet::WhoReply { header, who_data } => {
                debug!(
                    from = %header.originator_mud,
                    users = who_data.len(),
                    "who reply received"
                );
                let key = format!("{}:{}", header.target_user, header.originator_mud);
                self.pending.complete(&key, who_data);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }
}
