use thiserror::Error;

use crate::network::lpc::LpcError;
use crate::network::mudmode::MudModeError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LPC codec error: {0}")]
    Lpc(#[from] LpcError),

    #[error("MudMode protocol error: {0}")]
    MudMode(#[from] MudModeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::State(e.to_string())
    }
}
