//! RFCOMM transport implementation for Bluetooth serial connections

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::Address;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }

    /// Get the peer Bluetooth address
    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for RfcommTransportStream {
    fn peer(&self) -> String {
        self.peer_address().to_string()
    }
}

/// RFCOMM connector for a paired device
pub struct RfcommConnector {
    address: Address,
    channel: u8,
    endpoint: String,
}

impl RfcommConnector {
    /// Create connector for a known device address
    pub fn new(address: Address, channel: u8) -> Self {
        Self {
            address,
            channel,
            endpoint: address.to_string(),
        }
    }

    /// Create connector from a `XX:XX:XX:XX:XX:XX` endpoint string
    pub fn from_endpoint(endpoint: &str, channel: u8) -> Result<Self> {
        let address = Address::from_str(endpoint.trim())
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("invalid Bluetooth address {:?}", endpoint))?;
        Ok(Self::new(address, channel))
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }
}

#[async_trait]
impl TransportConnector for RfcommConnector {
    type Stream = RfcommTransportStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let socket_addr = RfcommAddr::new(self.address, self.channel);
        info!("[BT] Connecting to {} channel {}", self.address, self.channel);

        let stream = RfcommStream::connect(socket_addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;

        info!("[BT] Connected to {}", self.address);
        Ok(RfcommTransportStream::new(stream, self.address))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_with_address() {
        let addr = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let connector = RfcommConnector::new(addr, 5);
        assert_eq!(connector.address, addr);
        assert_eq!(connector.channel(), 5);
        assert_eq!(connector.endpoint(), "00:11:22:33:44:55");
        assert_eq!(connector.name(), "Bluetooth");
    }

    #[test]
    fn test_connector_from_endpoint() {
        let connector = RfcommConnector::from_endpoint("AA:BB:CC:DD:EE:FF", 1).unwrap();
        assert_eq!(
            connector.address,
            Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
    }

    #[test]
    fn test_connector_rejects_bad_address() {
        assert!(RfcommConnector::from_endpoint("xx:xx:xx:xx:xx:xx", 1).is_err());
        assert!(RfcommConnector::from_endpoint("127.0.0.1:9000", 1).is_err());
    }
}
