//! In-memory transport built on `tokio::io::duplex`
//!
//! Lets the connection manager run without a radio. Connect outcomes can be
//! scripted: refused attempts, and links whose far end is gone on arrival.

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Default in-memory pipe buffer
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Client side of an in-memory link
pub struct MemoryStream {
    inner: DuplexStream,
    label: String,
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for MemoryStream {
    fn peer(&self) -> String {
        self.label.clone()
    }
}

#[derive(Debug, Default)]
struct Script {
    fail_next: u32,
    break_next: u32,
    held: Option<oneshot::Receiver<bool>>,
    attempts: Vec<Instant>,
    links: u64,
}

/// Connector producing in-memory links; clones share one script
#[derive(Clone)]
pub struct MemoryConnector {
    endpoint: String,
    buffer_size: usize,
    script: Arc<Mutex<Script>>,
    peer_tx: mpsc::UnboundedSender<DuplexStream>,
}

/// Far end of the links created by a [`MemoryConnector`]
pub struct MemoryPeer {
    peer_rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryPeer {
    /// Wait for the next established link
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.peer_rx.recv().await
    }
}

impl MemoryConnector {
    pub fn new(endpoint: impl Into<String>) -> (Self, MemoryPeer) {
        Self::with_buffer(endpoint, DEFAULT_BUFFER_SIZE)
    }

    /// Use a specific pipe buffer; a small one makes writes wait on the reader
    pub fn with_buffer(endpoint: impl Into<String>, buffer_size: usize) -> (Self, MemoryPeer) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let connector = Self {
            endpoint: endpoint.into(),
            buffer_size,
            script: Arc::new(Mutex::new(Script::default())),
            peer_tx,
        };
        (connector, MemoryPeer { peer_rx })
    }

    /// Refuse the next `n` connect attempts
    pub fn fail_next(&self, n: u32) {
        self.script.lock().fail_next = n;
    }

    /// Let the next `n` connects succeed with the far end already dropped
    pub fn break_next(&self, n: u32) {
        self.script.lock().break_next = n;
    }

    /// Hold the next connect attempt until the returned sender fires
    ///
    /// Sending `true` lets it proceed; `false` or dropping the sender refuses it.
    pub fn hold_next(&self) -> oneshot::Sender<bool> {
        let (release, held) = oneshot::channel();
        self.script.lock().held = Some(held);
        release
    }

    /// When each connect attempt started
    pub fn attempts(&self) -> Vec<Instant> {
        self.script.lock().attempts.clone()
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Stream = MemoryStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let held = {
            let mut script = self.script.lock();
            script.attempts.push(Instant::now());
            script.held.take()
        };
        if let Some(held) = held {
            if !held.await.unwrap_or(false) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
        }

        let (broken, link) = {
            let mut script = self.script.lock();

            if script.fail_next > 0 {
                script.fail_next -= 1;
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }

            let broken = script.break_next > 0;
            if broken {
                script.break_next -= 1;
            }
            script.links += 1;
            (broken, script.links)
        };

        let (client, server) = tokio::io::duplex(self.buffer_size);
        if !broken {
            // A closed receiver leaves the far end dropped, same as a broken link
            let _ = self.peer_tx.send(server);
        }

        Ok(MemoryStream {
            inner: client,
            label: format!("{}#{}", self.endpoint, link),
        })
    }

    fn name(&self) -> &'static str {
        "Memory"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
