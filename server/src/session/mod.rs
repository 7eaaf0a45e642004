//! Per-connection session handling

mod connection;

pub use connection::PeerSession;
