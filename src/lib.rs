// Intermud3 Gateway
//
// Bridges a single MUD to the Intermud-3 network: MudMode/LPC upstream to
// an I3 router, JSON-RPC 2.0 downstream to local clients.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod network;
pub mod protocol;
pub mod services;
pub mod state;
pub mod util;

pub use config::Settings;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
