// Gateway configuration
//
// Settings are loaded from a JSON file with serde defaults, so a partial
// config file only needs to name the keys it overrides.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Identity of the MUD this gateway represents on the I3 network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MudConfig {
    pub name: String,
    pub port: u16,
    pub admin_email: String,
    pub mudlib: String,
    pub base_mudlib: String,
    pub driver: String,
    pub mud_type: String,
    pub open_status: String,
    /// Service name -> enabled flag (non-zero means advertised)
    pub services: HashMap<String, i32>,
}

impl Default for MudConfig {
    fn default() -> Self {
        let mut services = HashMap::new();
        for svc in ["tell", "emoteto", "channel", "who", "finger", "locate"] {
            services.insert(svc.to_string(), 1);
        }
        Self {
            name: "UnnamedMud".to_string(),
            port: 4000,
            admin_email: "admin@example.com".to_string(),
            mudlib: "CustomLib".to_string(),
            base_mudlib: "LPMud".to_string(),
            driver: "Custom".to_string(),
            mud_type: "LP".to_string(),
            open_status: "open".to_string(),
            services,
        }
    }
}

/// Address of a single I3 router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub name: String,
}

/// Upstream router selection: one primary plus ordered fallbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub primary: RouterEndpoint,
    pub fallback: Vec<RouterEndpoint>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary: RouterEndpoint {
                host: "204.209.44.3".to_string(),
                port: 8080,
                name: "*i3".to_string(),
            },
            fallback: Vec::new(),
        }
    }
}

/// Local gateway behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Bind address for the downstream API surface
    pub host: String,
    pub port: u16,
    /// Upper bound on a single MudMode frame
    pub max_packet_size: usize,
    /// Connection timeout in seconds
    pub timeout: u64,
    pub retry_attempts: u32,
    /// Base retry delay in seconds
    pub retry_delay: f64,
    /// Directory for mudlist/channel snapshots
    pub state_dir: String,
    /// Seconds between keepalive probes on the router link
    pub keepalive_interval: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_packet_size: 65536,
            timeout: 30,
            retry_attempts: 3,
            retry_delay: 1.0,
            state_dir: "./state".to_string(),
            keepalive_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Root configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mud: MudConfig,
    pub router: RouterConfig,
    pub gateway: GatewaySettings,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Configuration(format!("cannot read {:?}: {}", path, e)))?;
        serde_json::from_str(&data)
            .map_err(|e| GatewayError::Configuration(format!("cannot parse {:?}: {}", path, e)))
    }

    /// All configured routers, primary first, priorities ascending
    pub fn router_endpoints(&self) -> Vec<(RouterEndpoint, u32)> {
        let mut out = vec![(self.router.primary.clone(), 0)];
        for (i, ep) in self.router.fallback.iter().enumerate() {
            out.push((ep.clone(), (i + 1) as u32));
        }
        out
    }
}
