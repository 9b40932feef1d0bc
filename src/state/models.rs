// Gateway state entities
//
// MUD directory entries, channel descriptors and local user sessions. These
// are owned by the StateManager and mutated only through it.

use crate::network::lpc::LpcValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Liveness of a MUD as reported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MudStatus {
    Up,
    Down,
    Unknown,
    Reboot,
}

/// Information about a MUD in the I3 network
#[derive(Debug, Clone)]
pub struct MudInfo {
    pub name: String,
    pub address: String,
    pub player_port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,

    pub mudlib: String,
    pub base_mudlib: String,
    pub driver: String,
    pub mud_type: String,
    pub open_status: String,
    pub admin_email: String,

    /// Service name -> flag; non-zero means supported
    pub services: HashMap<String, i32>,
    pub other_data: HashMap<String, String>,

    pub status: MudStatus,
    pub last_startup: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl MudInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: String::new(),
            player_port: 0,
            tcp_port: 0,
            udp_port: 0,
            mudlib: String::new(),
            base_mudlib: String::new(),
            driver: String::new(),
            mud_type: String::new(),
            open_status: String::new(),
            admin_email: String::new(),
            services: HashMap::new(),
            other_data: HashMap::new(),
            status: MudStatus::Unknown,
            last_startup: None,
            last_seen: None,
        }
    }

    pub fn supports_service(&self, service: &str) -> bool {
        self.services.get(service).map(|v| *v > 0).unwrap_or(false)
    }

    pub fn is_online(&self) -> bool {
        self.status == MudStatus::Up
    }

    /// Apply one positional info array from a mudlist packet.
    ///
    /// Field layout: address, player port, TCP port, UDP port, mudlib,
    /// base mudlib, driver, mud type, open status, admin email, services
    /// mapping, other data mapping. An address of wire-zero marks the MUD
    /// down.
    pub fn update_from_mudlist(&mut self, data: &[LpcValue]) {
        let down = data.first().map(|v| v.is_zero()).unwrap_or(true);
        if !down {
            if let Some(addr) = data.first() {
                self.address = addr.to_string_lossy();
            }
        }
        if let Some(port) = data.get(1).and_then(|v| v.as_int()) {
            self.player_port = port.clamp(0, u16::MAX as i32) as u16;
        }
        if let Some(port) = data.get(2).and_then(|v| v.as_int()) {
            self.tcp_port = port.clamp(0, u16::MAX as i32) as u16;
        }
        if let Some(port) = data.get(3).and_then(|v| v.as_int()) {
            self.udp_port = port.clamp(0, u16::MAX as i32) as u16;
        }

        set_if_present(data, 4, &mut self.mudlib);
        set_if_present(data, 5, &mut self.base_mudlib);
        set_if_present(data, 6, &mut self.driver);
        set_if_present(data, 7, &mut self.mud_type);
        set_if_present(data, 8, &mut self.open_status);
        set_if_present(data, 9, &mut self.admin_email);

        if let Some(pairs) = data.get(10).and_then(|v| v.as_mapping()) {
            self.services = pairs
                .iter()
                .map(|(k, v)| (k.to_string_lossy(), v.as_int().unwrap_or(0)))
                .collect();
        }
        if let Some(pairs) = data.get(11).and_then(|v| v.as_mapping()) {
            self.other_data = pairs
                .iter()
                .map(|(k, v)| (k.to_string_lossy(), v.to_string_lossy()))
                .collect();
        }

        self.status = if down { MudStatus::Down } else { MudStatus::Up };
        self.last_seen = Some(Utc::now());
    }
}

fn set_if_present(data: &[LpcValue], idx: usize, field: &mut String) {
    if let Some(v) = data.get(idx) {
        if !v.is_zero() {
            *field = v.to_string_lossy();
        }
    }
}

/// Channel access classes
pub const CHANNEL_PUBLIC: i32 = 0;
pub const CHANNEL_SELECTIVE: i32 = 1;
pub const CHANNEL_PRIVATE: i32 = 2;

/// Information about an I3 channel
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub owner: String,
    /// 0 = public, 1 = selective, 2 = private
    pub channel_type: i32,

    pub banned_muds: HashSet<String>,
    pub admitted_muds: HashSet<String>,

    pub listening_muds: HashSet<String>,
    /// mud name -> users active on the channel from that mud
    pub active_users: HashMap<String, HashSet<String>>,

    pub message_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            channel_type: CHANNEL_PUBLIC,
            banned_muds: HashSet::new(),
            admitted_muds: HashSet::new(),
            listening_muds: HashSet::new(),
            active_users: HashMap::new(),
            message_count: 0,
            created_at: Some(Utc::now()),
            last_activity: None,
        }
    }

    pub fn is_public(&self) -> bool {
        self.channel_type == CHANNEL_PUBLIC
    }

    /// Banned MUDs never get in; non-public channels additionally require
    /// admission.
    pub fn can_access(&self, mud_name: &str) -> bool {
        if self.banned_muds.contains(mud_name) {
            return false;
        }
        self.is_public() || self.admitted_muds.contains(mud_name)
    }

    pub fn add_listener(&mut self, mud_name: &str) {
        self.listening_muds.insert(mud_name.to_string());
    }

    pub fn remove_listener(&mut self, mud_name: &str) {
        self.listening_muds.remove(mud_name);
        self.active_users.remove(mud_name);
    }

    pub fn add_user(&mut self, mud_name: &str, user_name: &str) {
        self.active_users
            .entry(mud_name.to_string())
            .or_default()
            .insert(user_name.to_string());
        self.last_activity = Some(Utc::now());
    }

    pub fn remove_user(&mut self, mud_name: &str, user_name: &str) {
        if let Some(users) = self.active_users.get_mut(mud_name) {
            users.remove(user_name);
            if users.is_empty() {
                self.active_users.remove(mud_name);
            }
        }
    }

    pub fn record_message(&mut self) {
        self.message_count += 1;
        self.last_activity = Some(Utc::now());
    }
}

/// Optional profile data a MUD reports for a local user; consumed by the
/// who/finger/locate services.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub title: Option<String>,
    pub real_name: Option<String>,
    pub email: Option<String>,
    pub level: Option<i32>,
    pub char_class: Option<String>,
    pub race: Option<String>,
    pub guild: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub plan: Option<String>,
    pub status_message: Option<String>,
}

/// A local user session tracked by the gateway
#[derive(Debug, Clone)]
pub struct UserSession {
    pub session_id: String,
    pub mud_name: String,
    pub user_name: String,

    pub authenticated: bool,
    pub auth_time: Option<DateTime<Utc>>,
    pub auth_token: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub online: bool,

    pub blocked_users: HashSet<String>,
    pub blocked_muds: HashSet<String>,
    pub listening_channels: HashSet<String>,

    pub messages_sent: u64,
    pub messages_received: u64,

    pub profile: UserProfile,
}

impl UserSession {
    pub fn new(session_id: String, mud_name: String, user_name: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            mud_name,
            user_name,
            authenticated: false,
            auth_time: None,
            auth_token: None,
            created_at: now,
            last_activity: now,
            online: true,
            blocked_users: HashSet::new(),
            blocked_muds: HashSet::new(),
            listening_channels: HashSet::new(),
            messages_sent: 0,
            messages_received: 0,
            profile: UserProfile::default(),
        }
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Seconds since the user last did anything
    pub fn idle_seconds(&self) -> i64 {
        (Utc::now() - self.last_activity).num_seconds().max(0)
    }

    pub fn is_blocked(&self, mud_name: &str, user_name: &str) -> bool {
        if self.blocked_muds.contains(mud_name) {
            return true;
        }
        self.blocked_users
            .contains(&format!("{}@{}", user_name, mud_name))
    }

    pub fn block_user(&mut self, mud_name: &str, user_name: &str) {
        self.blocked_users
            .insert(format!("{}@{}", user_name, mud_name));
    }

    pub fn unblock_user(&mut self, mud_name: &str, user_name: &str) {
        self.blocked_users
            .remove(&format!("{}@{}", user_name, mud_name));
    }

    pub fn block_mud(&mut self, mud_name: &str) {
        self.blocked_muds.insert(mud_name.to_string());
    }

    pub fn unblock_mud(&mut self, mud_name: &str) {
        self.blocked_muds.remove(mud_name);
    }
}
