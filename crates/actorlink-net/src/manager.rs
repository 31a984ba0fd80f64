//! Connection manager
//!
//! One event loop owns the set of live connections. Dialers, the listener
//! and the connections themselves only talk to it through [`ManagerEvent`]s,
//! so admission, replacement and loss are applied in a single order and each
//! produces one topology snapshot.
//!
//! Dialers keep one connection per configured peer alive, reconnecting with
//! capped exponential backoff. When two connections to the same node are
//! admitted, the newer one replaces the older, except for a simultaneous
//! cross-dial between the same incarnations: there both sides keep the
//! connection initiated by the lower node id.

use crate::config::{BackoffPolicy, NodeConfig, PeerConfig};
use crate::connection::{CloseReason, Connection, ConnectionSettings};
use crate::dispatch::Dispatcher;
use crate::framing::{Frame, FrameCodec, TopologyUpdate};
use crate::handshake::{perform_handshake, Handshake, HandshakeError, HandshakeInfo, Session};
use crate::peer::{Direction, PeerIdentity};
use crate::routing::RoutingTable;
use crate::snapshot::SnapshotCell;
use crate::topology::{Topology, TopologyEvent};
use crate::transport::{self, BoxedReader, BoxedWriter, Listener, Stream};
use actorlink_core::digest::short_hex;
use actorlink_core::{ActorAddr, Envelope, LaunchId, NodeId};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the topology event channel
const TOPOLOGY_EVENTS: usize = 256;

/// Pause after a failed accept
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Dial failures
#[derive(Debug, Error)]
pub(crate) enum DialError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connection manager stopped")]
    Stopped,
}

/// Input to the manager event loop
pub(crate) enum ManagerEvent {
    Handshaken(Box<Handshaken>),
    Closed {
        conn: Arc<Connection>,
        reason: CloseReason,
    },
    Topology {
        conn: Arc<Connection>,
        update: TopologyUpdate,
    },
    Advertise(Vec<ActorAddr>),
    Withdraw(Vec<ActorAddr>),
}

/// A transport that completed the handshake, waiting for admission
pub(crate) struct Handshaken {
    session: Session,
    reader: FramedRead<BoxedReader, FrameCodec>,
    writer: FramedWrite<BoxedWriter, FrameCodec>,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    admitted: oneshot::Sender<Option<Arc<Connection>>>,
}

/// Result of a completed handshake
pub(crate) struct Admission {
    pub(crate) node: NodeId,
    /// `None` if an existing connection to the node was kept instead
    pub(crate) conn: Option<Arc<Connection>>,
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    dial_attempts: AtomicU64,
    handshake_failures: AtomicU64,
    admitted: AtomicU64,
    duplicates: AtomicU64,
    replaced: AtomicU64,
    lost: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Connection manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub connected: usize,
    pub dial_attempts: u64,
    pub handshake_failures: u64,
    pub admitted: u64,
    /// Connections dropped in favour of an existing one
    pub duplicates: u64,
    /// Connections closed in favour of a newer one
    pub replaced: u64,
    pub lost: u64,
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Reconnection delays: exponential, capped, jittered downwards, never
/// shorter than the previous delay until reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let nominal = self
            .policy
            .initial
            .saturating_mul(factor)
            .min(self.policy.max);
        let jitter = nominal.mul_f64(self.policy.jitter * rand::random::<f64>());

        let delay = nominal
            .saturating_sub(jitter)
            .max(self.last)
            .min(self.policy.max);

        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Shared entry point into the manager
#[derive(Clone)]
pub(crate) struct ManagerHandle {
    config: Arc<NodeConfig>,
    launch_id: LaunchId,
    events: mpsc::UnboundedSender<ManagerEvent>,
    topology: Arc<SnapshotCell<Topology>>,
    topology_tx: broadcast::Sender<TopologyEvent>,
    counters: Arc<Counters>,
}

impl ManagerHandle {
    pub(crate) fn topology(&self) -> Arc<Topology> {
        self.topology.load()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology_tx.subscribe()
    }

    pub(crate) fn advertise(&self, addrs: Vec<ActorAddr>) {
        let _ = self.events.send(ManagerEvent::Advertise(addrs));
    }

    pub(crate) fn withdraw(&self, addrs: Vec<ActorAddr>) {
        let _ = self.events.send(ManagerEvent::Withdraw(addrs));
    }

    pub(crate) fn stats(&self) -> ManagerStats {
        let c = &self.counters;
        ManagerStats {
            connected: self.topology.load().len(),
            dial_attempts: c.dial_attempts.load(Ordering::Relaxed),
            handshake_failures: c.handshake_failures.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            replaced: c.replaced.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
        }
    }

    fn local_info(&self) -> HandshakeInfo {
        let digest = match self.topology.load().digest() {
            Ok(digest) => Bytes::copy_from_slice(&digest),
            Err(err) => {
                debug!("Failed to compute topology digest: {}", err);
                Bytes::new()
            }
        };
        HandshakeInfo {
            versions: self.config.versions,
            node_id: self.config.node_id,
            launch_id: self.launch_id,
            node_name: self.config.node_name.clone(),
            capabilities: self.config.capabilities.clone(),
            topology_digest: digest,
        }
    }

    /// Handshake over a fresh transport and hand it to the manager
    async fn establish(
        &self,
        stream: Stream,
        direction: Direction,
        expected: Option<NodeId>,
        cancel: &CancellationToken,
    ) -> Result<Admission, DialError> {
        let Stream {
            reader,
            writer,
            remote: remote_addr,
        } = stream;
        let codec = FrameCodec::with_max_frame_size(self.config.max_frame_size);
        let mut reader = FramedRead::new(reader, codec.clone());
        let mut writer = FramedWrite::new(writer, codec);

        let handshake = Handshake::new(self.local_info(), expected);
        let session = perform_handshake(
            &mut reader,
            &mut writer,
            handshake,
            self.config.handshake_timeout,
            cancel,
        )
        .await
        .map_err(|err| {
            if !matches!(err, HandshakeError::Cancelled) {
                bump(&self.counters.handshake_failures);
            }
            err
        })?;

        debug!(
            "Handshake with {} ({}) complete, peer digest {}",
            session.peer.node_id,
            direction,
            short_hex(&session.peer.topology_digest)
        );

        let node = session.peer.node_id;
        let (admitted, rx) = oneshot::channel();
        self.events
            .send(ManagerEvent::Handshaken(Box::new(Handshaken {
                session,
                reader,
                writer,
                direction,
                remote_addr,
                admitted,
            })))
            .map_err(|_| DialError::Stopped)?;

        let conn = rx.await.map_err(|_| DialError::Stopped)?;
        Ok(Admission { node, conn })
    }
}

// =============================================================================
// EVENT LOOP
// =============================================================================

/// State owned by the manager event loop
pub(crate) struct ConnectionManager {
    handle: ManagerHandle,
    rx: mpsc::UnboundedReceiver<ManagerEvent>,
    peers: BTreeMap<NodeId, Arc<Connection>>,
    advertised: BTreeSet<ActorAddr>,
    routing: RoutingTable,
    dispatcher: Dispatcher,
    settings: ConnectionSettings,
    /// Parent of every connection token
    root: CancellationToken,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: Arc<NodeConfig>,
        launch_id: LaunchId,
        routing: RoutingTable,
        inbound: mpsc::Sender<Envelope>,
        root: CancellationToken,
    ) -> (Self, ManagerHandle) {
        let (events, rx) = mpsc::unbounded_channel();
        let (topology_tx, _) = broadcast::channel(TOPOLOGY_EVENTS);

        let handle = ManagerHandle {
            config: config.clone(),
            launch_id,
            events: events.clone(),
            topology: Arc::new(SnapshotCell::new(Topology::new(config.node_id, launch_id))),
            topology_tx,
            counters: Arc::new(Counters::default()),
        };

        let manager = Self {
            handle: handle.clone(),
            rx,
            peers: BTreeMap::new(),
            advertised: BTreeSet::new(),
            dispatcher: Dispatcher::new(config.node_id, inbound, routing.clone(), events),
            routing,
            settings: config.connection_settings(),
            root,
        };

        (manager, handle)
    }

    /// Run until the root token is cancelled
    pub(crate) async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.root.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ManagerEvent::Handshaken(handshaken) => self.on_handshaken(*handshaken),
                ManagerEvent::Closed { conn, reason } => self.on_closed(conn, reason),
                ManagerEvent::Topology { conn, update } => self.on_topology(conn, update),
                ManagerEvent::Advertise(addrs) => self.on_advertise(addrs),
                ManagerEvent::Withdraw(addrs) => self.on_withdraw(addrs),
            }
        }

        debug!("Connection manager stopped");
    }

    fn is_current(&self, conn: &Connection) -> bool {
        self.peers
            .get(&conn.peer().node_id)
            .is_some_and(|current| current.id() == conn.id())
    }

    fn on_handshaken(&mut self, handshaken: Handshaken) {
        let Handshaken {
            session,
            reader,
            writer,
            direction,
            remote_addr,
            admitted,
        } = handshaken;

        let local = self.handle.config.node_id;
        let identity = PeerIdentity::from_session(session, direction, remote_addr);
        let node = identity.node_id;

        let replaced = self.peers.get(&node).cloned();
        if let Some(existing) = &replaced {
            if existing.is_open() && keep_existing(local, existing.peer(), &identity) {
                debug!(
                    "Keeping connection {} to node {}, dropping {} duplicate",
                    existing.id(),
                    node,
                    direction
                );
                bump(&self.handle.counters.duplicates);
                let _ = admitted.send(None);
                return;
            }
        }

        let conn = Connection::spawn(
            reader,
            writer,
            identity,
            &self.settings,
            self.dispatcher.clone(),
            &self.root,
        );
        self.peers.insert(node, conn.clone());
        self.routing.peer_joined(&conn);
        self.publish_topology();
        bump(&self.handle.counters.admitted);

        let joined = TopologyEvent::PeerJoined {
            node,
            launch_id: conn.peer().launch_id,
            name: conn.peer().name.clone(),
        };

        match replaced {
            Some(old) => {
                bump(&self.handle.counters.replaced);
                old.close(CloseReason::Replaced);
                if old.peer().launch_id != conn.peer().launch_id {
                    info!(
                        "Node {} restarted ({} -> {})",
                        node,
                        old.peer().launch_id,
                        conn.peer().launch_id
                    );
                    self.emit(TopologyEvent::PeerLost {
                        node,
                        launch_id: old.peer().launch_id,
                        reason: CloseReason::Replaced,
                    });
                    self.emit(joined);
                }
            }
            None => {
                info!("Node {} joined ({})", node, conn.peer());
                self.emit(joined);
            }
        }

        let update = TopologyUpdate {
            full: true,
            advertised: self.advertised.iter().copied().collect(),
            withdrawn: Vec::new(),
        };
        if let Err(err) = conn.try_send(Frame::TopologyUpdate(update)) {
            warn!("Failed to advertise to node {}: {}", node, err);
        }

        let _ = admitted.send(Some(conn));
    }

    fn on_closed(&mut self, conn: Arc<Connection>, reason: CloseReason) {
        if !self.is_current(&conn) {
            debug!("Connection {} was already superseded", conn.id());
            return;
        }

        let node = conn.peer().node_id;
        self.peers.remove(&node);
        self.routing.peer_lost(node);
        self.publish_topology();
        bump(&self.handle.counters.lost);

        info!("Node {} lost: {}", node, reason);
        self.emit(TopologyEvent::PeerLost {
            node,
            launch_id: conn.peer().launch_id,
            reason,
        });
    }

    fn on_topology(&mut self, conn: Arc<Connection>, update: TopologyUpdate) {
        if !self.is_current(&conn) {
            return;
        }
        debug!(
            "Node {} advertised {} and withdrew {} addresses{}",
            conn.peer().node_id,
            update.advertised.len(),
            update.withdrawn.len(),
            if update.full { " (full)" } else { "" }
        );
        self.routing.apply_update(&conn, &update);
    }

    fn on_advertise(&mut self, addrs: Vec<ActorAddr>) {
        let fresh: Vec<_> = addrs
            .into_iter()
            .filter(|addr| self.advertised.insert(*addr))
            .collect();
        if fresh.is_empty() {
            return;
        }

        self.routing.register_local(&fresh);
        self.broadcast(TopologyUpdate {
            full: false,
            advertised: fresh,
            withdrawn: Vec::new(),
        });
    }

    fn on_withdraw(&mut self, addrs: Vec<ActorAddr>) {
        let gone: Vec<_> = addrs
            .into_iter()
            .filter(|addr| self.advertised.remove(addr))
            .collect();
        if gone.is_empty() {
            return;
        }

        self.routing.unregister_local(&gone);
        self.broadcast(TopologyUpdate {
            full: false,
            advertised: Vec::new(),
            withdrawn: gone,
        });
    }

    fn broadcast(&self, update: TopologyUpdate) {
        for conn in self.peers.values() {
            if let Err(err) = conn.try_send(Frame::TopologyUpdate(update.clone())) {
                warn!(
                    "Failed to send topology update to node {}: {}",
                    conn.peer().node_id,
                    err
                );
            }
        }
    }

    fn publish_topology(&self) {
        let next = self.handle.topology.load().with_peers(self.peers.clone());
        self.handle.topology.store(next);
    }

    fn emit(&self, event: TopologyEvent) {
        // no subscribers is fine
        let _ = self.handle.topology_tx.send(event);
    }
}

/// Whether an existing connection survives a new one to the same node
fn keep_existing(local: NodeId, existing: &PeerIdentity, new: &PeerIdentity) -> bool {
    existing.launch_id == new.launch_id
        && existing.direction != new.direction
        && existing.initiator(local) == local.min(new.node_id)
}

// =============================================================================
// DIALING AND ACCEPTING
// =============================================================================

/// Sleep for `delay`; false if cancelled first
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Keep a connection to `peer` until cancelled
pub(crate) async fn dial_loop(handle: ManagerHandle, peer: PeerConfig, cancel: CancellationToken) {
    let mut backoff = Backoff::new(handle.config.backoff.clone());
    let mut known = peer.expected;

    loop {
        let existing = known
            .and_then(|node| handle.topology().connection(node).cloned())
            .filter(|conn| conn.is_open());

        if let Some(conn) = existing {
            debug!(
                "Node {} already connected via {}, not dialing {}",
                conn.peer().node_id,
                conn.id(),
                peer
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = conn.closed() => {}
            }
            backoff.reset();
        } else {
            bump(&handle.counters.dial_attempts);
            match dial(&handle, &peer, &cancel).await {
                Ok(Admission { node, conn }) => {
                    known = Some(node);
                    backoff.reset();
                    if let Some(conn) = conn {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = conn.closed() => {}
                        }
                    }
                }
                Err(DialError::Handshake(HandshakeError::Cancelled)) | Err(DialError::Stopped) => {
                    break
                }
                Err(DialError::Handshake(HandshakeError::SelfConnection)) => {
                    warn!("Peer {} is this node, not dialing it again", peer);
                    break;
                }
                Err(err) => warn!("Dial {} failed: {}", peer, err),
            }
        }

        let delay = backoff.next_delay();
        debug!("Reconnecting to {} in {:?}", peer, delay);
        if !pause(&cancel, delay).await {
            break;
        }
    }

    debug!("Dialer for {} stopped", peer);
}

async fn dial(
    handle: &ManagerHandle,
    peer: &PeerConfig,
    cancel: &CancellationToken,
) -> Result<Admission, DialError> {
    let connect = tokio::time::timeout(
        handle.config.handshake_timeout,
        transport::connect(&peer.transport),
    );

    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(HandshakeError::Cancelled.into()),
        result = connect => result
            .map_err(|_| DialError::ConnectTimeout)?
            .map_err(DialError::Connect)?,
    };

    handle
        .establish(stream, Direction::Outbound, peer.expected, cancel)
        .await
}

/// Accept inbound connections until cancelled
pub(crate) async fn accept_loop(
    listener: Listener,
    handle: ManagerHandle,
    cancel: CancellationToken,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Accept error: {}", err);
                    if !pause(&cancel, ACCEPT_ERROR_PAUSE).await {
                        break;
                    }
                    continue;
                }
            },
        };

        debug!("Accepted connection from {}", remote);
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = handle
                .establish(stream, Direction::Inbound, None, &cancel)
                .await
            {
                warn!("Inbound connection from {} failed: {}", remote, err);
            }
        });
    }

    debug!("Listener stopped");
}
