//! Transport trait abstraction for pluggable byte-stream backends

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A transport stream that can read and write bytes
///
/// Closing is done through `AsyncWriteExt::shutdown` on the write half, so
/// the stream can be split between a reader task and the writer lock.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Human-readable identity of the remote side
    fn peer(&self) -> String;
}

/// Factory for creating transport connections to one fixed endpoint
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// The stream type this connector produces
    type Stream: TransportStream;

    /// Attempt to connect, returning a stream on success
    async fn connect(&self) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;

    /// The endpoint this connector targets
    fn endpoint(&self) -> &str;
}
