//! Connection management for a reliable delivery channel
//!
//! This module handles:
//! - Queued delivery with in-order retry after a failed write
//! - Automatic reconnection with exponential backoff
//! - Heartbeat frames to detect dead links while idle

mod backoff;
mod manager;

pub use backoff::Backoff;
pub use manager::{ConnectionEvent, ConnectionManager, EventReceiver, SendOutcome};
pub use urlcast_shared::ConnectionState;
