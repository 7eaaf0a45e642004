//! Connection manager with queued delivery, heartbeats and automatic reconnection

use crate::config::ChannelConfig;
use crate::connection::backoff::Backoff;
use crate::error::{ChannelError, Result};
use crate::queue::OutboundQueue;
use crate::transport::{TransportConnector, TransportStream};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use urlcast_shared::codec;
use urlcast_shared::state_machine::{
    is_valid_transition, ConnectionState, LinkEvent, LinkStateMachine, TransitionResult,
};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport session established
    Connected { endpoint: String, session: u64 },
    /// Session ended (lost or closed)
    Disconnected { reason: String },
    /// Waiting `delay` before connect attempt number `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// A connect attempt failed
    ConnectFailed { attempt: u32, reason: String },
    /// Message fully written to the transport
    SendSucceeded { seq: u64 },
    /// Write failed; the message went back to the front of the queue
    SendFailed { seq: u64, reason: String },
    /// Non-empty frame received from the peer
    Received(Bytes),
}

/// Receiving side of the observability hook
///
/// Bounded by `event_capacity`; events that do not fit are dropped.
pub type EventReceiver = mpsc::Receiver<ConnectionEvent>;

/// What happened to a message handed to [`ConnectionManager::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Fully written to the transport
    Written(u64),
    /// Waiting in the queue for the next session
    Queued(u64),
}

impl SendOutcome {
    pub fn seq(&self) -> u64 {
        match self {
            SendOutcome::Written(seq) | SendOutcome::Queued(seq) => *seq,
        }
    }
}

/// Write half of the live session, guarded by the write lock
struct SessionWriter<S> {
    session: u64,
    half: WriteHalf<S>,
    shutdown: watch::Receiver<bool>,
}

impl<S> SessionWriter<S> {
    fn is_stale(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }
}

struct Session {
    id: u64,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Tell the session's reader, heartbeat, drain and any in-flight write to stop
    fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

struct Link {
    fsm: LinkStateMachine,
    session: Option<Session>,
    /// Background connect or reconnect loop
    pending: Option<JoinHandle<()>>,
    /// Bumped by every connect request and by close; outcomes of older attempts are discarded
    attempt: u64,
    backoff: Backoff,
    sessions_opened: u64,
    last_activity: Option<Instant>,
}

impl Link {
    fn new(backoff: Backoff) -> Self {
        Self {
            fsm: LinkStateMachine::new(),
            session: None,
            pending: None,
            attempt: 0,
            backoff,
            sessions_opened: 0,
            last_activity: None,
        }
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt
    }
}

struct Inner<C: TransportConnector> {
    connector: C,
    config: ChannelConfig,
    queue: OutboundQueue,
    link: Mutex<Link>,
    /// Only the holder of this lock writes to the transport
    writer: AsyncMutex<Option<SessionWriter<C::Stream>>>,
    drain_signal: Notify,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl<C: TransportConnector> Inner<C> {
    /// Apply an event to the state machine; `Err` carries the rejecting state
    fn transition(
        &self,
        link: &mut Link,
        event: LinkEvent,
    ) -> std::result::Result<ConnectionState, ConnectionState> {
        let from = link.fsm.state();
        match link.fsm.process_event(event) {
            TransitionResult::Success(to) => {
                debug_assert!(is_valid_transition(from, to));
                if from != to {
                    debug!("[CONN] State {} -> {}", from, to);
                }
                self.state_tx.send_replace(to);
                Ok(to)
            }
            TransitionResult::Invalid { from, .. } => Err(from),
        }
    }
}

/// Owns one logical channel to one endpoint
///
/// Cloning is cheap and every clone drives the same channel. Background
/// tasks keep the channel alive until [`ConnectionManager::close`] is called.
pub struct ConnectionManager<C: TransportConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: TransportConnector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: TransportConnector> ConnectionManager<C> {
    /// Create a manager in `Disconnected` state
    pub fn new(connector: C, config: ChannelConfig) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Inner {
            connector,
            queue: OutboundQueue::new(config.queue_capacity),
            link: Mutex::new(Link::new(Backoff::new(config.backoff.clone()))),
            config,
            writer: AsyncMutex::new(None),
            drain_signal: Notify::new(),
            state_tx,
            event_tx,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().fsm.state()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Number of messages waiting for delivery (excluding one in flight)
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Sequence numbers waiting for delivery, front first
    pub fn queued_sequences(&self) -> Vec<u64> {
        self.inner.queue.sequence_numbers()
    }

    /// Last successful read or write on the current or previous session
    pub fn last_activity(&self) -> Option<Instant> {
        self.inner.link.lock().last_activity
    }

    /// Make one connect attempt and wait for its outcome
    pub async fn connect(&self) -> Result<()> {
        let attempt = self.request(LinkEvent::ConnectRequested)?;
        self.finish_connect(attempt).await
    }

    /// Connect in the background
    ///
    /// With `auto_reconnect` this keeps retrying with backoff until connected
    /// or closed; otherwise it makes a single attempt.
    pub fn start(&self) -> Result<()> {
        let mut link = self.inner.link.lock();
        let auto_reconnect = self.inner.config.auto_reconnect;
        let event = if auto_reconnect {
            LinkEvent::ReconnectRequested
        } else {
            LinkEvent::ConnectRequested
        };
        self.inner
            .transition(&mut link, event)
            .map_err(already_busy)?;
        let attempt = link.next_attempt();

        let this = self.clone();
        let task = if auto_reconnect {
            tokio::spawn(this.reconnect_loop(attempt))
        } else {
            tokio::spawn(async move {
                let _ = this.finish_connect(attempt).await;
            })
        };
        link.pending = Some(task);
        Ok(())
    }

    /// Queue a payload for delivery without waiting
    ///
    /// This is the entry point for callers that just hand over a URL. Empty
    /// text is rejected: a zero-length frame is a heartbeat on the wire.
    pub fn submit(&self, text: impl Into<String>) -> Result<u64> {
        let seq = self.enqueue(Bytes::from(text.into()))?;
        self.inner.drain_signal.notify_one();
        Ok(seq)
    }

    /// Queue a payload and, if connected, wait until it has been written
    ///
    /// Transport failures are not returned here: the message stays queued,
    /// the outcome is `Queued` and the failure shows up as events.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<SendOutcome> {
        let seq = self.enqueue(payload.into())?;
        if self.state() != ConnectionState::Connected {
            return Ok(SendOutcome::Queued(seq));
        }

        let mut slot = self.inner.writer.lock().await;
        self.drain_locked(&mut slot).await;
        // Under the write lock nothing else is in flight
        let queued = self.inner.queue.contains(seq);
        drop(slot);

        if queued {
            Ok(SendOutcome::Queued(seq))
        } else {
            Ok(SendOutcome::Written(seq))
        }
    }

    /// Stop the channel; queued messages are kept for a later connect
    ///
    /// Transport errors during close are logged, never returned.
    pub async fn close(&self) {
        let (was, session) = {
            let mut link = self.inner.link.lock();
            if let Some(task) = link.pending.take() {
                task.abort();
            }
            // Fences off an explicit connect still waiting on the transport
            link.next_attempt();
            link.backoff.reset();
            let was = link.fsm.state();
            let _ = self.inner.transition(&mut link, LinkEvent::Closed);
            (was, link.session.take())
        };
        if let Some(session) = session {
            session.stop();
        }

        let io_timeout = self.inner.config.io_timeout();
        match timeout(io_timeout, self.inner.writer.lock()).await {
            Ok(mut slot) => {
                if let Some(mut writer) = slot.take() {
                    match timeout(io_timeout, writer.half.shutdown()).await {
                        Ok(Ok(())) => debug!("[CONN] Transport shut down"),
                        Ok(Err(e)) => warn!("[CONN] Error closing transport: {}", e),
                        Err(_) => warn!("[CONN] Transport close timed out after {:?}", io_timeout),
                    }
                }
            }
            Err(_) => warn!(
                "[CONN] Write still in flight after {:?}, abandoning transport",
                io_timeout
            ),
        }

        if was != ConnectionState::Disconnected {
            info!(
                "[CONN] Channel to {} closed, {} message(s) queued",
                self.endpoint(),
                self.queued()
            );
            self.emit(ConnectionEvent::Disconnected {
                reason: "closed".into(),
            });
        }
    }

    fn request(&self, event: LinkEvent) -> Result<u64> {
        let mut link = self.inner.link.lock();
        self.inner
            .transition(&mut link, event)
            .map_err(already_busy)?;
        Ok(link.next_attempt())
    }

    fn enqueue(&self, payload: Bytes) -> Result<u64> {
        if payload.is_empty() {
            return Err(ChannelError::EmptyPayload);
        }
        let max = self.inner.config.max_payload_bytes;
        if payload.len() > max {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.inner.queue.enqueue(payload)
    }

    fn emit(&self, event: ConnectionEvent) {
        match self.inner.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                trace!("[CONN] Event channel full, dropping {:?}", event);
            }
            // Nobody listening is fine
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn touch(&self) {
        self.inner.link.lock().last_activity = Some(Instant::now());
    }

    /// Finish a single attempt started from `Connecting`
    async fn finish_connect(&self, attempt: u64) -> Result<()> {
        let endpoint = self.endpoint().to_string();
        let reason = match self.attempt().await {
            Ok(stream) => {
                if self.establish(stream, attempt).await {
                    return Ok(());
                }
                "closed while connecting".to_string()
            }
            Err(reason) => {
                {
                    let mut link = self.inner.link.lock();
                    if link.attempt != attempt {
                        debug!("[CONN] Ignoring failure of superseded attempt: {}", reason);
                        return Err(ChannelError::ConnectFailed {
                            endpoint,
                            reason: "closed while connecting".into(),
                        });
                    }
                    let _ = self.inner.transition(&mut link, LinkEvent::AttemptFailed);
                }
                warn!("[CONN] Connect to {} failed: {}", endpoint, reason);
                self.emit(ConnectionEvent::ConnectFailed {
                    attempt: 1,
                    reason: reason.clone(),
                });
                reason
            }
        };
        Err(ChannelError::ConnectFailed { endpoint, reason })
    }

    async fn attempt(&self) -> std::result::Result<C::Stream, String> {
        let io_timeout = self.inner.config.io_timeout();
        match timeout(io_timeout, self.inner.connector.connect()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", io_timeout)),
        }
    }

    /// Install a fresh session; false if the attempt was superseded or closed
    async fn establish(&self, stream: C::Stream, attempt: u64) -> bool {
        let peer = stream.peer();
        let (read_half, write_half) = tokio::io::split(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut slot = self.inner.writer.lock().await;
        let session = {
            let mut link = self.inner.link.lock();
            if link.attempt != attempt
                || self
                    .inner
                    .transition(&mut link, LinkEvent::Established)
                    .is_err()
            {
                return false;
            }
            if link.backoff.failures() > 0 {
                debug!(
                    "[CONN] Recovered after {} failed attempt(s)",
                    link.backoff.failures()
                );
                link.backoff.reset();
            }
            link.sessions_opened += 1;
            let id = link.sessions_opened;
            link.session = Some(Session {
                id,
                shutdown: shutdown_tx,
            });
            link.pending = None;
            link.last_activity = Some(Instant::now());
            id
        };
        *slot = Some(SessionWriter {
            session,
            half: write_half,
            shutdown: shutdown_rx.clone(),
        });
        drop(slot);

        tokio::spawn(self.clone().read_loop(session, read_half, shutdown_rx.clone()));
        tokio::spawn(self.clone().heartbeat_loop(session, shutdown_rx.clone()));
        tokio::spawn(self.clone().drain_loop(session, shutdown_rx));

        info!(
            "[CONN] Connected to {} via {} (session {})",
            peer,
            self.inner.connector.name(),
            session
        );
        self.emit(ConnectionEvent::Connected {
            endpoint: self.endpoint().to_string(),
            session,
        });
        self.inner.drain_signal.notify_one();
        true
    }

    /// Tear down a failed session and decide between reconnecting and idling
    fn on_session_failure(&self, session: u64, reason: String) {
        let mut link = self.inner.link.lock();
        if link.session.as_ref().map(|s| s.id) != Some(session) {
            // Already replaced or closed
            return;
        }

        let reconnect = self.inner.config.auto_reconnect;
        let event = if reconnect {
            LinkEvent::ReconnectRequested
        } else {
            LinkEvent::Lost
        };
        if self.inner.transition(&mut link, event).is_err() {
            return;
        }
        if let Some(old) = link.session.take() {
            old.stop();
        }

        warn!("[CONN] Lost connection to {}: {}", self.endpoint(), reason);
        self.emit(ConnectionEvent::Disconnected { reason });

        if reconnect {
            let attempt = link.next_attempt();
            link.pending = Some(tokio::spawn(self.clone().reconnect_loop(attempt)));
        }
    }

    /// Retry connecting with exponential backoff while in `Reconnecting`
    async fn reconnect_loop(self, generation: u64) {
        loop {
            match self.attempt().await {
                Ok(stream) => {
                    if !self.establish(stream, generation).await {
                        debug!("[CONN] Reconnect abandoned, channel closed");
                    }
                    return;
                }
                Err(reason) => {
                    let (attempt, delay) = {
                        let mut link = self.inner.link.lock();
                        if link.attempt != generation
                            || self
                                .inner
                                .transition(&mut link, LinkEvent::AttemptFailed)
                                .is_err()
                        {
                            return;
                        }
                        let delay = link.backoff.next_delay();
                        (link.backoff.failures(), delay)
                    };

                    warn!(
                        "[CONN] Attempt {} to {} failed: {}, retrying in {:?}",
                        attempt,
                        self.endpoint(),
                        reason,
                        delay
                    );
                    self.emit(ConnectionEvent::ConnectFailed { attempt, reason });
                    self.emit(ConnectionEvent::Reconnecting {
                        attempt: attempt + 1,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Write queued messages in order until the queue is empty or a write fails
    async fn drain_locked(&self, slot: &mut Option<SessionWriter<C::Stream>>) {
        let max = self.inner.config.max_payload_bytes;

        loop {
            let Some(writer) = slot.as_mut() else {
                return;
            };
            if writer.is_stale() {
                return;
            }
            let Some(in_flight) = self.inner.queue.pop_in_flight() else {
                return;
            };
            let seq = in_flight.message().seq;
            let waited = in_flight.message().enqueued_at.elapsed();

            let frame = match codec::encode(&in_flight.message().payload, max) {
                Ok(frame) => frame,
                Err(e) => {
                    // Retrying can never succeed
                    error!("[CONN] Dropping #{}: {}", seq, e);
                    in_flight.complete();
                    self.emit(ConnectionEvent::SendFailed {
                        seq,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match self.write_frame(writer, &frame).await {
                Ok(()) => {
                    in_flight.complete();
                    self.touch();
                    debug!(
                        "[CONN] Sent #{} ({} bytes, queued for {:?})",
                        seq,
                        frame.len(),
                        waited
                    );
                    self.emit(ConnectionEvent::SendSucceeded { seq });
                }
                Err(e) => {
                    // Back to the front of the queue
                    drop(in_flight);
                    debug!("[CONN] Send #{} failed: {}", seq, e);
                    self.emit(ConnectionEvent::SendFailed {
                        seq,
                        reason: e.to_string(),
                    });

                    if !writer.is_stale() {
                        let session = writer.session;
                        *slot = None;
                        self.on_session_failure(session, format!("write failed: {}", e));
                    }
                    return;
                }
            }
        }
    }

    /// Write one frame, bounded by the I/O timeout and the session's shutdown signal
    async fn write_frame(&self, writer: &mut SessionWriter<C::Stream>, frame: &[u8]) -> Result<()> {
        let io_timeout = self.inner.config.io_timeout();
        let mut shutdown = writer.shutdown.clone();
        let half = &mut writer.half;
        let write = async move {
            half.write_all(frame).await?;
            half.flush().await
        };

        tokio::select! {
            result = timeout(io_timeout, write) => match result {
                Ok(result) => result.map_err(ChannelError::Io),
                Err(_) => Err(ChannelError::Timeout(io_timeout)),
            },
            _ = shutdown.changed() => Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "channel closed",
            ))),
        }
    }

    async fn drain_loop(self, session: u64, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = self.inner.drain_signal.notified() => {}
            }

            let mut slot = self.inner.writer.lock().await;
            if !matches!(slot.as_ref(), Some(w) if w.session == session) {
                return;
            }
            self.drain_locked(&mut slot).await;
        }
    }

    async fn heartbeat_loop(self, session: u64, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let frame = codec::heartbeat_frame();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            // A send in flight already proves liveness
            let Ok(mut slot) = self.inner.writer.try_lock() else {
                trace!("[CONN] Heartbeat skipped, write in flight");
                continue;
            };
            let Some(writer) = slot
                .as_mut()
                .filter(|w| w.session == session && !w.is_stale())
            else {
                return;
            };

            match self.write_frame(writer, &frame).await {
                Ok(()) => {
                    trace!("[CONN] Heartbeat sent");
                    self.touch();
                }
                Err(e) => {
                    if !writer.is_stale() {
                        *slot = None;
                        drop(slot);
                        self.on_session_failure(session, format!("heartbeat failed: {}", e));
                    }
                    return;
                }
            }
        }
    }

    async fn read_loop(
        self,
        session: u64,
        mut reader: ReadHalf<C::Stream>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let max = self.inner.config.max_payload_bytes;

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => return,
                result = codec::read_frame(&mut reader, max) => result,
            };

            match result {
                Ok(Some(payload)) => {
                    self.touch();
                    if payload.is_empty() {
                        trace!("[CONN] Heartbeat from peer");
                    } else {
                        debug!("[CONN] Received {} bytes", payload.len());
                        self.emit(ConnectionEvent::Received(payload));
                    }
                }
                Ok(None) => {
                    self.on_session_failure(session, "peer closed the connection".into());
                    return;
                }
                Err(e) => {
                    // Partial frame is discarded with the session
                    self.on_session_failure(session, format!("read failed: {}", e));
                    return;
                }
            }
        }
    }
}

fn already_busy(state: ConnectionState) -> ChannelError {
    match state {
        ConnectionState::Connected => ChannelError::AlreadyConnected,
        _ => ChannelError::AlreadyConnecting,
    }
}
