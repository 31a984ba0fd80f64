//! Established connections
//!
//! A [`Connection`] owns one transport to one peer after a successful
//! handshake. Two tasks serve it:
//!
//! - the send loop drains a bounded outbound queue into the socket and emits
//!   heartbeats while idle
//! - the receive loop decodes frames, dispatches envelopes and watches the
//!   dead-peer deadline
//!
//! State only moves forward: `Established -> Closing -> Closed`. Whoever wins
//! the transition to `Closed` cancels the connection's token, which stops
//! both loops, and reports the reason to the connection manager.

use crate::dispatch::Dispatcher;
use crate::framing::{Frame, FrameCodec, ProtocolError};
use crate::manager::ManagerEvent;
use crate::peer::{PeerIdentity, PeerState};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Frames written per flush
const MAX_BATCH: usize = 64;

/// Errors surfaced to senders
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("outbound queue full for {0:?}")]
    Backpressure(Duration),
    #[error("connection closed")]
    Disconnected,
    #[error("peer stopped responding")]
    HeartbeatTimeout,
}

/// Why a connection closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Local shutdown
    Shutdown,
    /// Peer sent `Goodbye`
    PeerShutdown(String),
    /// Peer closed the transport without `Goodbye`
    Eof,
    /// Nothing heard within the dead-peer interval
    HeartbeatTimeout,
    /// Superseded by a newer connection to the same node
    Replaced,
    Io(String),
    Protocol(String),
}

impl CloseReason {
    fn from_protocol(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => Self::Io(err.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }

    /// Error reported to senders once closed for this reason
    pub fn to_error(&self) -> ConnectionError {
        match self {
            Self::HeartbeatTimeout => ConnectionError::HeartbeatTimeout,
            _ => ConnectionError::Disconnected,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("local shutdown"),
            Self::PeerShutdown(reason) => write!(f, "peer shut down: {reason}"),
            Self::Eof => f.write_str("peer closed the connection"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::Replaced => f.write_str("replaced by a newer connection"),
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

/// Process-unique connection identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Established = 0,
    /// Draining: no new frames accepted, queued frames still go out
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Established,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-connection tunables
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub queue_capacity: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub dead_peer_interval: Duration,
}

type Receipt = oneshot::Sender<Result<(), ConnectionError>>;

pub(crate) struct Outbound {
    pub(crate) frame: Frame,
    receipt: Option<Receipt>,
}

/// An established connection to a peer
pub struct Connection {
    id: ConnectionId,
    peer: PeerIdentity,
    tx: mpsc::Sender<Outbound>,
    capacity: usize,
    send_timeout: Duration,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    opened: Instant,
    /// Millis since `opened`
    last_heard: AtomicU64,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl Connection {
    fn new(
        peer: PeerIdentity,
        settings: &ConnectionSettings,
        events: mpsc::UnboundedSender<ManagerEvent>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            tx,
            capacity: settings.queue_capacity,
            send_timeout: settings.send_timeout,
            state: AtomicU8::new(ConnectionState::Established as u8),
            close_reason: Mutex::new(None),
            cancel,
            opened: Instant::now(),
            last_heard: AtomicU64::new(0),
            events,
        });
        (conn, rx)
    }

    /// Start serving a handshaken transport
    pub(crate) fn spawn<R, W>(
        reader: FramedRead<R, FrameCodec>,
        writer: FramedWrite<W, FrameCodec>,
        peer: PeerIdentity,
        settings: &ConnectionSettings,
        dispatcher: Dispatcher,
        parent: &CancellationToken,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, rx) = Self::new(
            peer,
            settings,
            dispatcher.events(),
            parent.child_token(),
        );

        info!(
            "Connection {} established with {} ({}, protocol v{})",
            conn.id, conn.peer, conn.peer.direction, conn.peer.version
        );

        tokio::spawn(send_loop(
            conn.clone(),
            writer,
            rx,
            settings.heartbeat_interval,
        ));
        tokio::spawn(recv_loop(
            conn.clone(),
            reader,
            dispatcher,
            settings.dead_peer_interval,
        ));

        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Accepting new frames
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Last time any frame arrived
    pub fn last_heard(&self) -> Instant {
        self.opened + Duration::from_millis(self.last_heard.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis() as u64;
        self.last_heard.store(elapsed, Ordering::Relaxed);
    }

    /// Frames waiting to be written
    pub fn queue_depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn snapshot(&self) -> PeerState {
        PeerState {
            identity: self.peer.clone(),
            connection_id: self.id,
            state: self.state(),
            last_heard: self.last_heard().into_std(),
            queue_depth: self.queue_depth(),
        }
    }

    fn closed_error(&self) -> ConnectionError {
        self.close_reason()
            .map(|reason| reason.to_error())
            .unwrap_or(ConnectionError::Disconnected)
    }

    /// Queue a frame, waiting up to the send timeout for room
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.enqueue(Outbound {
            frame,
            receipt: None,
        })
        .await
    }

    /// Queue a frame and wait until it has been flushed to the transport
    pub async fn send_confirmed(&self, frame: Frame) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outbound {
            frame,
            receipt: Some(tx),
        })
        .await?;
        rx.await.unwrap_or(Err(ConnectionError::Disconnected))
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        self.tx
            .try_send(Outbound {
                frame,
                receipt: None,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    ConnectionError::Backpressure(Duration::ZERO)
                }
                mpsc::error::TrySendError::Closed(_) => self.closed_error(),
            })
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            result = self.tx.send_timeout(outbound, self.send_timeout) => match result {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    Err(ConnectionError::Backpressure(self.send_timeout))
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(self.closed_error()),
            },
        }
    }

    /// Stop accepting frames, say goodbye after everything queued so far,
    /// and wait up to `grace` for it to be flushed.
    ///
    /// Returns whether the goodbye made it to the transport. The connection
    /// is left in `Closing`; cancelling its token finishes the close.
    pub async fn drain(&self, reason: &str, grace: Duration) -> bool {
        let moved = self.state.compare_exchange(
            ConnectionState::Established as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if moved.is_err() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        let goodbye = Outbound {
            frame: Frame::goodbye(reason),
            receipt: Some(tx),
        };

        let flushed = tokio::time::timeout(grace, async move {
            self.tx.send(goodbye).await.ok()?;
            rx.await.ok()?.ok()
        })
        .await;

        matches!(flushed, Ok(Some(())))
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return;
        }

        *self.close_reason.lock() = Some(reason.clone());
        self.cancel.cancel();

        match reason {
            CloseReason::Shutdown | CloseReason::Replaced => {
                debug!("Connection {} to {} closed: {}", self.id, self.peer, reason)
            }
            _ => info!("Connection {} to {} closed: {}", self.id, self.peer, reason),
        }

        let _ = self.events.send(ManagerEvent::Closed {
            conn: self.clone(),
            reason,
        });
    }

    /// Resolves once the connection is closed or its token is cancelled
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer.node_id)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// TASKS
// =============================================================================

async fn send_loop<W>(
    conn: Arc<Connection>,
    mut writer: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    heartbeat_interval: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sent = Instant::now();

    let reason = loop {
        let mut frames = Vec::new();
        let mut receipts = Vec::new();

        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break CloseReason::Shutdown,
            received = rx.recv() => {
                let Some(first) = received else { break CloseReason::Shutdown };
                let mut next = Some(first);
                while let Some(outbound) = next.take() {
                    frames.push(outbound.frame);
                    receipts.extend(outbound.receipt);
                    if frames.len() < MAX_BATCH {
                        next = rx.try_recv().ok();
                    }
                }
            }
            _ = ticker.tick() => {
                if last_sent.elapsed() < heartbeat_interval {
                    continue;
                }
                trace!("Heartbeat to {}", conn.peer.node_id);
                frames.push(Frame::heartbeat());
            }
        }

        let written = tokio::select! {
            _ = conn.cancel.cancelled() => None,
            result = write_frames(&mut writer, frames) => Some(result),
        };

        match written {
            Some(Ok(())) => {
                last_sent = Instant::now();
                for receipt in receipts {
                    let _ = receipt.send(Ok(()));
                }
            }
            Some(Err(err)) => {
                fail_all(receipts, ConnectionError::Disconnected);
                break CloseReason::from_protocol(err);
            }
            None => {
                fail_all(receipts, ConnectionError::Disconnected);
                break CloseReason::Shutdown;
            }
        }
    };

    conn.close(reason);

    rx.close();
    let error = conn.closed_error();
    while let Ok(outbound) = rx.try_recv() {
        if let Some(receipt) = outbound.receipt {
            let _ = receipt.send(Err(error.clone()));
        }
    }
}

async fn write_frames<W>(
    writer: &mut FramedWrite<W, FrameCodec>,
    frames: Vec<Frame>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    for frame in frames {
        writer.feed(frame).await?;
    }
    writer.flush().await
}

fn fail_all(receipts: Vec<Receipt>, error: ConnectionError) {
    for receipt in receipts {
        let _ = receipt.send(Err(error.clone()));
    }
}

async fn recv_loop<R>(
    conn: Arc<Connection>,
    mut reader: FramedRead<R, FrameCodec>,
    dispatcher: Dispatcher,
    dead_peer_interval: Duration,
) where
    R: AsyncRead + Unpin,
{
    conn.touch();

    let reason = loop {
        let deadline = conn.last_heard() + dead_peer_interval;

        let next = tokio::select! {
            _ = conn.cancel.cancelled() => break CloseReason::Shutdown,
            _ = tokio::time::sleep_until(deadline) => break CloseReason::HeartbeatTimeout,
            next = reader.next() => next,
        };
        conn.touch();

        let frame = match next {
            None => break CloseReason::Eof,
            Some(Err(err)) => break CloseReason::from_protocol(err),
            Some(Ok(Err(unknown))) => {
                warn!("Skipping frame from {}: {}", conn.peer.node_id, unknown);
                continue;
            }
            Some(Ok(Ok(frame))) => frame,
        };

        match frame {
            Frame::Data(envelope) => {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break CloseReason::Shutdown,
                    _ = dispatcher.on_envelope(&conn, envelope) => {}
                }
                // time spent blocked on delivery is not the peer's silence
                conn.touch();
            }
            Frame::Heartbeat(_) => trace!("Heartbeat from {}", conn.peer.node_id),
            Frame::TopologyUpdate(update) => dispatcher.on_topology(&conn, update),
            Frame::Goodbye(goodbye) => break CloseReason::PeerShutdown(goodbye.reason),
            other => {
                break CloseReason::Protocol(
                    ProtocolError::UnexpectedFrame(other.frame_type()).to_string(),
                )
            }
        }
    };

    conn.close(reason);
}
