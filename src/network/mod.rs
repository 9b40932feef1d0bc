// Networking layer: the LPC codec, MudMode framing, the router connection
// manager and connection pooling.

pub mod connection;
pub mod lpc;
pub mod mudmode;
pub mod pool;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, RouterInfo};
pub use lpc::{LpcCodec, LpcError, LpcValue};
pub use mudmode::{encode_frame, FrameReader, MudModeError};
