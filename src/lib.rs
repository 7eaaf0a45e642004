//! Reliable delivery channel for short text payloads (URLs) over a
//! Bluetooth RFCOMM link, with a TCP transport for development.

pub mod config;
pub mod connection;
pub mod error;
pub mod queue;
pub mod transport;

pub use config::{ChannelConfig, TransportMode};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, EventReceiver, SendOutcome};
pub use error::{ChannelError, Result};
