//! urlcast Shared Protocol Types
//!
//! This crate provides the framing codec and link state machine shared by
//! the urlcast sender and the receiving server.

pub mod codec;
pub mod state_machine;

pub use codec::{CodecError, FrameDecoder};
pub use state_machine::{ConnectionState, LinkEvent, LinkStateMachine, TransitionResult};

/// Default channel parameters
pub mod defaults {
    /// Largest payload accepted by the framer
    pub const MAX_PAYLOAD_BYTES: usize = 65535;

    /// Heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    /// Upper bound for a single connect, write or close
    pub const IO_TIMEOUT_MS: u64 = 5000;

    /// First reconnect delay
    pub const BACKOFF_BASE_MS: u64 = 1000;

    /// Reconnect delay growth factor
    pub const BACKOFF_FACTOR: u32 = 2;

    /// Reconnect delay ceiling
    pub const BACKOFF_CAP_MS: u64 = 30_000;

    /// Connection events buffered for the caller before new ones are dropped
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

    /// RFCOMM channel the receiver listens on
    pub const RFCOMM_CHANNEL: u8 = 1;

    /// TCP address used when simulating the serial link
    pub const TCP_SIMULATION_ADDR: &str = "127.0.0.1:9000";
}
