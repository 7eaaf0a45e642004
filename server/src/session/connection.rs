//! A single sender's session

use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use urlcast_shared::codec::{self, FrameDecoder};
use urlcast_shared::defaults::MAX_PAYLOAD_BYTES;
use urlcast_shared::CodecError;

/// Reads framed text payloads from one connected sender
pub struct PeerSession<S> {
    peer: String,
    reader: S,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    connected_at: Instant,
    last_seen: Instant,
    heartbeats: u64,
}

impl<S: AsyncRead + Unpin> PeerSession<S> {
    pub fn new(reader: S, peer: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            peer: peer.into(),
            reader,
            decoder: FrameDecoder::new(MAX_PAYLOAD_BYTES),
            read_buf: vec![0u8; 4096],
            connected_at: now,
            last_seen: now,
            heartbeats: 0,
        }
    }

    /// Read the next text payload, skipping heartbeats
    ///
    /// Returns `Ok(None)` when the sender closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<String>, CodecError> {
        loop {
            // First try what is already buffered
            while let Some(payload) = self.decoder.decode_next()? {
                self.last_seen = Instant::now();
                if payload.is_empty() {
                    self.heartbeats += 1;
                    continue;
                }
                return Ok(Some(codec::decode_text(&payload)?.to_string()));
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                let pending = self.decoder.buffer_len();
                if pending > 0 {
                    return Err(CodecError::IncompleteFrame {
                        expected: codec::FRAME_HEADER_LEN,
                        received: pending,
                    });
                }
                return Ok(None);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Last time any frame, heartbeats included, arrived
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }
}
