//! Error types for the delivery channel

use std::time::Duration;
use thiserror::Error;
use urlcast_shared::CodecError;

/// Errors surfaced by the queue, the connection manager and the Submit API
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Transport refused or endpoint unreachable
    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// Read or write failed mid-operation
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Caller handed in a payload the framer will not carry
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Zero-length payloads are reserved for heartbeats
    #[error("Payload is empty")]
    EmptyPayload,

    /// Outbound queue is at its configured capacity
    #[error("Outbound queue full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    /// Peer sent something the framer could not decode
    #[error("Protocol error: {0}")]
    Codec(CodecError),

    #[error("Connection attempt already in progress")]
    AlreadyConnecting,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::PayloadTooLarge { size, max } => ChannelError::PayloadTooLarge { size, max },
            CodecError::Io(e) => ChannelError::Io(e),
            other => ChannelError::Codec(other),
        }
    }
}

/// Result type alias using ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_errors_map_to_channel_taxonomy() {
        let err: ChannelError = CodecError::PayloadTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, ChannelError::PayloadTooLarge { size: 10, max: 5 }));

        let err: ChannelError = CodecError::IncompleteFrame {
            expected: 5,
            received: 3,
        }
        .into();
        assert!(matches!(
            err,
            ChannelError::Codec(CodecError::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn test_error_messages() {
        let err = ChannelError::QueueFull { capacity: 2 };
        assert_eq!(err.to_string(), "Outbound queue full (capacity: 2)");
    }
}
