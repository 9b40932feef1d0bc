// Gateway state management
//
// One process-wide store for the mudlist, channel list, user sessions and a
// TTL cache. The four maps sit behind independent locks so readers and
// writers on different maps never contend; when more than one lock is ever
// needed the order is mudlist -> channels -> sessions -> cache.

pub mod models;

pub use models::{ChannelInfo, MudInfo, MudStatus, UserProfile, UserSession};

use crate::error::Result;
use crate::network::lpc::LpcValue;
use crate::protocol::ChanlistEntry;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cadence of the background sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Sessions idle longer than this are dropped by the sweep
const SESSION_MAX_IDLE_HOURS: i64 = 24;
/// Positive-cache TTL for mud lookups
const MUD_CACHE_TTL: Duration = Duration::from_secs(60);

/// A simple TTL cache; reads past expiry are misses and evict the entry
pub struct TtlCache<V: Clone> {
    entries: Mutex<HashMap<String, (V, Instant)>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries
            .lock()
            .insert(key.into(), (value, Instant::now() + ttl));
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every expired entry
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, (_, expiry)| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Default)]
struct MudRegistry {
    mudlist_id: i32,
    muds: HashMap<String, MudInfo>,
}

#[derive(Default)]
struct ChannelRegistry {
    chanlist_id: i32,
    channels: HashMap<String, ChannelInfo>,
}

// Snapshot file formats

#[derive(Serialize, Deserialize)]
struct MudSnapshotEntry {
    name: String,
    address: String,
    player_port: u16,
    tcp_port: u16,
    services: HashMap<String, i32>,
    status: MudStatus,
}

#[derive(Serialize, Deserialize)]
struct MudlistSnapshot {
    mudlist_id: i32,
    muds: HashMap<String, MudSnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct ChannelSnapshotEntry {
    name: String,
    owner: String,
    #[serde(rename = "type")]
    channel_type: i32,
    banned_muds: Vec<String>,
    admitted_muds: Vec<String>,
}

/// Process-wide state store
pub struct StateManager {
    mudlist: RwLock<MudRegistry>,
    channels: RwLock<ChannelRegistry>,
    sessions: RwLock<HashMap<String, UserSession>>,
    cache: TtlCache<MudInfo>,
    persistence_dir: Option<PathBuf>,
    sweeper_stop: Arc<Notify>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StateManager {
    pub fn new(persistence_dir: Option<PathBuf>) -> Self {
        Self {
            mudlist: RwLock::new(MudRegistry::default()),
            channels: RwLock::new(ChannelRegistry::default()),
            sessions: RwLock::new(HashMap::new()),
            cache: TtlCache::new(Duration::from_secs(300)),
            persistence_dir,
            sweeper_stop: Arc::new(Notify::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Load persisted state and start the background sweep
    pub async fn start(self: &Arc<Self>) {
        if self.persistence_dir.is_some() {
            self.load_snapshot().await;
        }

        let manager = Arc::clone(self);
        let stop = Arc::clone(&self.sweeper_stop);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        manager.sweep_once().await;
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the sweep and persist a final snapshot
    pub async fn stop(&self) {
        self.sweeper_stop.notify_waiters();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        if self.persistence_dir.is_some() {
            if let Err(e) = self.save_snapshot().await {
                error!(error = %e, "failed to save state snapshot");
            }
        }
    }

    /// One pass of the background sweep: expire cache entries and drop
    /// sessions idle for more than a day.
    pub async fn sweep_once(&self) {
        self.cache.cleanup();

        let cutoff = Utc::now() - ChronoDuration::hours(SESSION_MAX_IDLE_HOURS);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity >= cutoff);
        let dropped = before - sessions.len();
        if dropped > 0 {
            debug!(dropped, "swept expired sessions");
        }
    }

    // ------------------------------------------------------------------
    // Mudlist
    // ------------------------------------------------------------------

    /// Apply a mudlist delta: create-or-update every named MUD, mark every
    /// known name absent from the delta as down, store the new id.
    pub async fn update_mudlist(&self, delta: &[(String, LpcValue)], mudlist_id: i32) {
        let mut registry = self.mudlist.write().await;
        registry.mudlist_id = mudlist_id;

        for (name, data) in delta {
            let entry = registry
                .muds
                .entry(name.clone())
                .or_insert_with(|| MudInfo::new(name.clone()));
            match data.as_array() {
                Some(fields) => entry.update_from_mudlist(fields),
                // A zero payload is the router deleting the entry
                None => entry.status = MudStatus::Down,
            }
            self.cache.delete(&format!("mud:{}", name));
        }

        let named: std::collections::HashSet<&str> =
            delta.iter().map(|(name, _)| name.as_str()).collect();
        for (name, mud) in registry.muds.iter_mut() {
            if !named.contains(name.as_str()) {
                mud.status = MudStatus::Down;
            }
        }

        info!(mudlist_id, muds = delta.len(), "mudlist updated");
    }

    pub async fn mudlist_id(&self) -> i32 {
        self.mudlist.read().await.mudlist_id
    }

    /// Cached lookup of a single MUD (60s positive TTL)
    pub async fn get_mud_info(&self, mud_name: &str) -> Option<MudInfo> {
        let key = format!("mud:{}", mud_name);
        if let Some(cached) = self.cache.get(&key) {
            return Some(cached);
        }

        let registry = self.mudlist.read().await;
        let mud = registry.muds.get(mud_name).cloned();
        if let Some(ref info) = mud {
            self.cache.set_with_ttl(key, info.clone(), MUD_CACHE_TTL);
        }
        mud
    }

    /// Snapshot of every MUD currently up
    pub async fn online_muds(&self) -> Vec<MudInfo> {
        self.mudlist
            .read()
            .await
            .muds
            .values()
            .filter(|m| m.is_online())
            .cloned()
            .collect()
    }

    pub async fn all_muds(&self) -> Vec<MudInfo> {
        self.mudlist.read().await.muds.values().cloned().collect()
    }

    pub async fn mud_count(&self) -> usize {
        self.mudlist.read().await.muds.len()
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Apply a chanlist delta; entries without info are router deletions
    pub async fn update_chanlist(&self, delta: &[ChanlistEntry], chanlist_id: i32) {
        let mut registry = self.channels.write().await;
        registry.chanlist_id = chanlist_id;

        for entry in delta {
            match &entry.info {
                Some((owner, channel_type)) => {
                    let channel = registry
                        .channels
                        .entry(entry.name.clone())
                        .or_insert_with(|| ChannelInfo::new(entry.name.clone()));
                    channel.owner = owner.clone();
                    channel.channel_type = *channel_type;
                }
                None => {
                    registry.channels.remove(&entry.name);
                }
            }
        }

        info!(chanlist_id, channels = delta.len(), "chanlist updated");
    }

    pub async fn chanlist_id(&self) -> i32 {
        self.channels.read().await.chanlist_id
    }

    /// Idempotent by name: an existing channel is replaced
    pub async fn add_channel(&self, channel: ChannelInfo) {
        self.channels
            .write()
            .await
            .channels
            .insert(channel.name.clone(), channel);
    }

    pub async fn get_channel(&self, name: &str) -> Option<ChannelInfo> {
        self.channels.read().await.channels.get(name).cloned()
    }

    pub async fn remove_channel(&self, name: &str) {
        self.channels.write().await.channels.remove(name);
    }

    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        self.channels.read().await.channels.values().cloned().collect()
    }

    /// Mutate a channel in place; returns false when it does not exist
    pub async fn with_channel_mut<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut ChannelInfo),
    {
        let mut registry = self.channels.write().await;
        match registry.channels.get_mut(name) {
            Some(channel) => {
                f(channel);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, mud_name: &str, user_name: &str) -> UserSession {
        let session = UserSession::new(
            Uuid::new_v4().to_string(),
            mud_name.to_string(),
            user_name.to_string(),
        );
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Fetch a session by id, touching its activity timestamp
    pub async fn get_session(&self, session_id: &str) -> Option<UserSession> {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(session_id).map(|session| {
            session.update_activity();
            session.clone()
        })
    }

    /// Case-insensitive lookup by user name
    pub async fn find_session_by_user(&self, user_name: &str) -> Option<UserSession> {
        let needle = user_name.to_lowercase();
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.user_name.to_lowercase() == needle)
            .cloned()
    }

    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn active_sessions(&self) -> Vec<UserSession> {
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.last_activity > cutoff)
            .cloned()
            .collect()
    }

    pub async fn online_sessions(&self) -> Vec<UserSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.online)
            .cloned()
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Mutate a session in place; returns false when it does not exist
    pub async fn with_session_mut<F>(&self, session_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut UserSession),
    {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn insert_session(&self, session: UserSession) {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session);
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Persist the mudlist and channel list as two JSON files
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(dir) = &self.persistence_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;

        {
            let registry = self.mudlist.read().await;
            let snapshot = MudlistSnapshot {
                mudlist_id: registry.mudlist_id,
                muds: registry
                    .muds
                    .iter()
                    .map(|(name, mud)| {
                        (
                            name.clone(),
                            MudSnapshotEntry {
                                name: mud.name.clone(),
                                address: mud.address.clone(),
                                player_port: mud.player_port,
                                tcp_port: mud.tcp_port,
                                services: mud.services.clone(),
                                status: mud.status,
                            },
                        )
                    })
                    .collect(),
            };
            std::fs::write(
                dir.join("mudlist.json"),
                serde_json::to_string_pretty(&snapshot)?,
            )?;
        }

        {
            let registry = self.channels.read().await;
            let snapshot: HashMap<String, ChannelSnapshotEntry> = registry
                .channels
                .iter()
                .map(|(name, channel)| {
                    (
                        name.clone(),
                        ChannelSnapshotEntry {
                            name: channel.name.clone(),
                            owner: channel.owner.clone(),
                            channel_type: channel.channel_type,
                            banned_muds: channel.banned_muds.iter().cloned().collect(),
                            admitted_muds: channel.admitted_muds.iter().cloned().collect(),
                        },
                    )
                })
                .collect();
            std::fs::write(
                dir.join("channels.json"),
                serde_json::to_string_pretty(&snapshot)?,
            )?;
        }

        debug!("state snapshot saved");
        Ok(())
    }

    /// Load snapshots if present; malformed files are logged and skipped
    pub async fn load_snapshot(&self) {
        let Some(dir) = &self.persistence_dir else {
            return;
        };

        let mudlist_file = dir.join("mudlist.json");
        if mudlist_file.exists() {
            match std::fs::read_to_string(&mudlist_file)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_str::<MudlistSnapshot>(&data).map_err(|e| e.to_string())
                }) {
                Ok(snapshot) => {
                    let mut registry = self.mudlist.write().await;
                    registry.mudlist_id = snapshot.mudlist_id;
                    for (name, entry) in snapshot.muds {
                        let mut mud = MudInfo::new(entry.name);
                        mud.address = entry.address;
                        mud.player_port = entry.player_port;
                        mud.tcp_port = entry.tcp_port;
                        mud.services = entry.services;
                        mud.status = entry.status;
                        registry.muds.insert(name, mud);
                    }
                    info!(muds = registry.muds.len(), "mudlist snapshot loaded");
                }
                Err(e) => warn!(error = %e, "skipping malformed mudlist snapshot"),
            }
        }

        let channels_file = dir.join("channels.json");
        if channels_file.exists() {
            match std::fs::read_to_string(&channels_file)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_str::<HashMap<String, ChannelSnapshotEntry>>(&data)
                        .map_err(|e| e.to_string())
                }) {
                Ok(snapshot) => {
                    let mut registry = self.channels.write().await;
                    for (name, entry) in snapshot {
                        let mut channel = ChannelInfo::new(entry.name);
                        channel.owner = entry.owner;
                        channel.channel_type = entry.channel_type;
                        channel.banned_muds = entry.banned_muds.into_iter().collect();
                        channel.admitted_muds = entry.admitted_muds.into_iter().collect();
                        registry.channels.insert(name, channel);
                    }
                    info!(channels = registry.channels.len(), "channel snapshot loaded");
                }
                Err(e) => warn!(error = %e, "skipping malformed channel snapshot"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn info_array(address: &str) -> LpcValue {
        LpcValue::Array(vec![
            LpcValue::string(address),
            LpcValue::Int(4000),
            LpcValue::Int(4001),
            LpcValue::Int(0),
            LpcValue::string("TestLib"),
            LpcValue::string("LPMud"),
            LpcValue::string("FluffOS"),
            LpcValue::string("LP"),
            LpcValue::string("open"),
            LpcValue::string("admin@mud"),
            LpcValue::Mapping(vec![(LpcValue::string("tell"), LpcValue::Int(1))]),
            LpcValue::Mapping(vec![]),
        ])
    }

    #[tokio::test]
    async fn test_update_mudlist_creates_and_marks_down() {
        let state = StateManager::new(None);

        state
            .update_mudlist(
                &[
                    ("MudA".to_string(), info_array("10.0.0.1")),
                    ("MudB".to_string(), info_array("10.0.0.2")),
                ],
                100,
            )
            .await;
        assert_eq!(state.mudlist_id().await, 100);
        assert_eq!(state.online_muds().await.len(), 2);

        // MudB absent from the next delta transitions to down
        state
            .update_mudlist(&[("MudA".to_string(), info_array("10.0.0.1"))], 101)
            .await;
        assert_eq!(state.mudlist_id().await, 101);
        let online = state.online_muds().await;
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, "MudA");
        assert_eq!(
            state.get_mud_info("MudB").await.unwrap().status,
            MudStatus::Down
        );
    }

    #[tokio::test]
    async fn test_mud_identity_retained_across_updates() {
        let state = StateManager::new(None);
        state
            .update_mudlist(&[("MudA".to_string(), info_array("10.0.0.1"))], 1)
            .await;
        let first = state.get_mud_info("MudA").await.unwrap();

        state
            .update_mudlist(&[("MudA".to_string(), info_array("10.9.9.9"))], 2)
            .await;
        let second = state.get_mud_info("MudA").await.unwrap();

        // Same entity, mutated in place
        assert_eq!(first.name, second.name);
        assert_eq!(second.address, "10.9.9.9");
        assert_eq!(state.mud_count().await, 1);
    }

    #[tokio::test]
    async fn test_get_mud_info_uses_cache() {
        let state = StateManager::new(None);
        state
            .update_mudlist(&[("MudA".to_string(), info_array("10.0.0.1"))], 1)
            .await;

        assert!(state.get_mud_info("MudA").await.is_some());
        assert!(state.cache.get("mud:MudA").is_some());
        assert!(state.get_mud_info("NoSuchMud").await.is_none());
        // Negative lookups are not cached
        assert!(state.cache.get("mud:NoSuchMud").is_none());
    }

    #[tokio::test]
    async fn test_chanlist_update_and_removal() {
        let state = StateManager::new(None);
        state
            .update_chanlist(
                &[ChanlistEntry {
                    name: "chat".to_string(),
                    info: Some(("*i3".to_string(), 0)),
                }],
                7,
            )
            .await;
        assert_eq!(state.chanlist_id().await, 7);
        assert_eq!(state.get_channel("chat").await.unwrap().owner, "*i3");

        state
            .update_chanlist(
                &[ChanlistEntry {
                    name: "chat".to_string(),
                    info: None,
                }],
                8,
            )
            .await;
        assert!(state.get_channel("chat").await.is_none());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let state = StateManager::new(None);
        let session = state.create_session("TestMUD", "bob").await;

        let fetched = state.get_session(&session.session_id).await.unwrap();
        assert!(fetched.last_activity >= session.last_activity);

        let by_name = state.find_session_by_user("BOB").await.unwrap();
        assert_eq!(by_name.session_id, session.session_id);

        state.remove_session(&session.session_id).await;
        assert!(state.get_session(&session.session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_drops_stale_sessions() {
        let state = StateManager::new(None);
        let mut stale = UserSession::new(
            "stale".to_string(),
            "TestMUD".to_string(),
            "ghost".to_string(),
        );
        stale.last_activity = Utc::now() - ChronoDuration::hours(25);
        state.insert_session(stale).await;
        state.create_session("TestMUD", "fresh").await;

        state.sweep_once().await;

        assert_eq!(state.session_count().await, 1);
        assert!(state.find_session_by_user("ghost").await.is_none());
        assert!(state.find_session_by_user("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(Some(dir.path().to_path_buf()));
        state
            .update_mudlist(&[("MudA".to_string(), info_array("10.0.0.1"))], 42)
            .await;
        let mut channel = ChannelInfo::new("chat");
        channel.owner = "*i3".to_string();
        channel.banned_muds.insert("BadMud".to_string());
        state.add_channel(channel).await;

        state.save_snapshot().await.unwrap();

        let restored = StateManager::new(Some(dir.path().to_path_buf()));
        restored.load_snapshot().await;
        assert_eq!(restored.mudlist_id().await, 42);
        assert_eq!(
            restored.get_mud_info("MudA").await.unwrap().address,
            "10.0.0.1"
        );
        let channel = restored.get_channel("chat").await.unwrap();
        assert!(channel.banned_muds.contains("BadMud"));
    }

    #[tokio::test]
    async fn test_malformed_snapshot_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mudlist.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("channels.json"), "[1,2,3]").unwrap();

        let state = StateManager::new(Some(dir.path().to_path_buf()));
        state.load_snapshot().await;
        assert_eq!(state.mud_count().await, 0);
        assert!(state.list_channels().await.is_empty());
    }

    #[test]
    fn test_ttl_cache_expiry() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_millis(10));
        cache.set("key", 1);
        assert_eq!(cache.get("key"), Some(1));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("key"), None);
        // The expired read evicted the entry
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_cache_cleanup() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_millis(10));
        cache.set("a", 1);
        cache.set_with_ttl("b", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));
        cache.cleanup();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }
}
