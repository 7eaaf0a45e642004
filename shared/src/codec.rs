//! Length-prefixed codec for stream framing
//!
//! All messages are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: UTF-8 payload ]
//! ```
//!
//! A byte-stream transport does not preserve write boundaries, so every
//! message carries its own length. A frame with `N = 0` is a heartbeat.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Incomplete frame: expected {expected} bytes, stream ended after {received}")]
    IncompleteFrame { expected: usize, received: usize },

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn check_len(len: usize, max: usize) -> Result<(), CodecError> {
    // The prefix is a u32, so the bound can never exceed it
    if len > max || len > u32::MAX as usize {
        return Err(CodecError::PayloadTooLarge { size: len, max });
    }
    Ok(())
}

/// Encode a payload into a length-prefixed byte buffer
pub fn encode(payload: &[u8], max_payload: usize) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_into(payload, max_payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a payload directly into a provided buffer
pub fn encode_into(payload: &[u8], max_payload: usize, buf: &mut BytesMut) -> Result<(), CodecError> {
    check_len(payload.len(), max_payload)?;

    buf.reserve(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    Ok(())
}

/// The zero-length frame used as a liveness probe
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(&[0u8; FRAME_HEADER_LEN])
}

/// Read exactly one frame from a stream
///
/// Returns:
/// - `Ok(Some(payload))` once the declared number of bytes has been read
/// - `Ok(None)` if the stream ended cleanly between frames
/// - `Err(IncompleteFrame)` if the stream ended inside a frame
/// - `Err(PayloadTooLarge)` if the declared length exceeds `max_payload`
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Bytes>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;

    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::IncompleteFrame {
                expected: FRAME_HEADER_LEN,
                received: filled,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    check_len(len, max_payload)?;

    let mut payload = BytesMut::zeroed(len);
    let mut received = 0;

    while received < len {
        let n = reader.read(&mut payload[received..]).await?;
        if n == 0 {
            return Err(CodecError::IncompleteFrame {
                expected: len,
                received,
            });
        }
        received += n;
    }

    Ok(Some(payload.freeze()))
}

/// Try to decode a length-prefixed payload from a buffer
///
/// Returns:
/// - `Ok(Some(payload))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the declared length is invalid
pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>, CodecError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    check_len(len, max_payload)?;

    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Interpret a decoded payload as text
pub fn decode_text(payload: &[u8]) -> Result<&str, CodecError> {
    Ok(std::str::from_utf8(payload)?)
}

/// Buffered decoder for callers that read in arbitrary chunks
#[derive(Debug)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(crate::defaults::MAX_PAYLOAD_BYTES)
    }
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_payload,
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        decode(&mut self.buffer, self.max_payload)
    }

    /// Bytes held that do not yet form a complete frame
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::MAX_PAYLOAD_BYTES;

    #[test]
    fn test_encode_decode_roundtrip() {
        let url = b"https://example.com/some/page?q=1";
        let encoded = encode(url, MAX_PAYLOAD_BYTES).expect("encode failed");

        let len_prefix = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len_prefix as usize, url.len());

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode(&mut buf, MAX_PAYLOAD_BYTES)
            .expect("decode failed")
            .expect("no frame");
        assert_eq!(&decoded[..], url);
        assert!(buf.is_empty(), "buffer should be empty after decode");
    }

    #[test]
    fn test_payload_at_limit_is_accepted() {
        let payload = vec![b'x'; 16];
        let encoded = encode(&payload, 16).expect("payload at the limit should encode");
        assert_eq!(encoded.len(), FRAME_HEADER_LEN + 16);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![b'x'; 17];
        let result = encode(&payload, 16);
        assert!(matches!(
            result,
            Err(CodecError::PayloadTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_heartbeat_frame_is_empty() {
        let hb = heartbeat_frame();
        assert_eq!(&hb[..], &[0, 0, 0, 0]);

        let mut buf = BytesMut::from(&hb[..]);
        let decoded = decode(&mut buf, MAX_PAYLOAD_BYTES).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_partial_decode() {
        let encoded = encode(b"http://a", MAX_PAYLOAD_BYTES).unwrap();

        let mut buf = BytesMut::from(&encoded[..5]);
        let result = decode(&mut buf, MAX_PAYLOAD_BYTES).expect("decode should not fail on partial data");
        assert!(result.is_none(), "should return None for partial data");

        // Buffer should be unchanged (data not consumed)
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_frame_decoder() {
        let encoded = encode(b"http://a", MAX_PAYLOAD_BYTES).unwrap();
        let mut decoder = FrameDecoder::default();

        decoder.extend(&encoded[..3]);
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.extend(&encoded[3..]);
        let decoded = decoder.decode_next().unwrap().expect("should have frame");
        assert_eq!(&decoded[..], b"http://a");
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_multiple_frames() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&encode(b"http://a", MAX_PAYLOAD_BYTES).unwrap());
        decoder.extend(&heartbeat_frame());
        decoder.extend(&encode(b"http://b", MAX_PAYLOAD_BYTES).unwrap());

        assert_eq!(&decoder.decode_next().unwrap().unwrap()[..], b"http://a");
        assert!(decoder.decode_next().unwrap().unwrap().is_empty());
        assert_eq!(&decoder.decode_next().unwrap().unwrap()[..], b"http://b");
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_PAYLOAD_BYTES as u32 + 1);
        buf.put_bytes(0, 100);

        let result = decode(&mut buf, MAX_PAYLOAD_BYTES);
        assert!(matches!(result, Err(CodecError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"http://a").unwrap(), "http://a");
        assert!(matches!(
            decode_text(&[0xff, 0xfe]),
            Err(CodecError::InvalidUtf8(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_sequence() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(b"http://a", MAX_PAYLOAD_BYTES).unwrap());
        stream.extend_from_slice(&heartbeat_frame());

        let mut reader = &stream[..];
        let first = read_frame(&mut reader, MAX_PAYLOAD_BYTES).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"http://a"[..]));

        let second = read_frame(&mut reader, MAX_PAYLOAD_BYTES).await.unwrap();
        assert_eq!(second.map(|b| b.len()), Some(0));

        // Clean end of stream between frames
        assert!(read_frame(&mut reader, MAX_PAYLOAD_BYTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_incomplete_payload() {
        let stream = [0u8, 0, 0, 5, b'a', b'b', b'c'];
        let mut reader = &stream[..];

        let result = read_frame(&mut reader, MAX_PAYLOAD_BYTES).await;
        assert!(matches!(
            result,
            Err(CodecError::IncompleteFrame { expected: 5, received: 3 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_incomplete_prefix() {
        let stream = [0u8, 0];
        let mut reader = &stream[..];

        let result = read_frame(&mut reader, MAX_PAYLOAD_BYTES).await;
        assert!(matches!(
            result,
            Err(CodecError::IncompleteFrame { expected: 4, received: 2 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_prefix() {
        let stream = [0u8, 0, 1, 0, b'a'];
        let mut reader = &stream[..];

        let result = read_frame(&mut reader, 255).await;
        assert!(matches!(
            result,
            Err(CodecError::PayloadTooLarge { size: 256, max: 255 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_across_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let encoded = encode(b"http://split", MAX_PAYLOAD_BYTES).unwrap();

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in encoded.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let payload = read_frame(&mut server, MAX_PAYLOAD_BYTES).await.unwrap().unwrap();
        assert_eq!(&payload[..], b"http://split");
        writer.await.unwrap();
    }
}
