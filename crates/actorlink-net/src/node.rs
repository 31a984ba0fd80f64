//! Node runtime
//!
//! [`Node::start`] binds the listener, starts the connection manager, one
//! dialer per configured peer and the accept loop, and returns the stream of
//! envelopes addressed to this node.
//!
//! Shutdown happens in two steps under two tokens: the intake token stops
//! dialing and accepting, every connection then says goodbye after its
//! queued frames, and finally the root token stops everything else.

use crate::config::{ConfigError, NodeConfig};
use crate::connection::ConnectionError;
use crate::framing::Frame;
use crate::manager::{accept_loop, dial_loop, ConnectionManager, ManagerHandle, ManagerStats};
use crate::peer::PeerState;
use crate::routing::{Route, RoutingError, RoutingTable};
use crate::topology::{Topology, TopologyEvent};
use crate::transport::{Listener, Transport};
use actorlink_core::{ActorAddr, CorrelationId, Envelope, LaunchId, NodeId, TraceIdGenerator};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Envelopes delivered to this node
pub type InboundStream = ReceiverStream<Envelope>;

/// Node startup errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: Transport,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope send errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<NodeConfig>,
    launch_id: LaunchId,
    local_addr: Transport,
    routing: RoutingTable,
    manager: ManagerHandle,
    /// Taken at shutdown so the inbound stream can end
    inbound: RwLock<Option<mpsc::Sender<Envelope>>>,
    trace_ids: TraceIdGenerator,
    intake: CancellationToken,
    root: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind, start background tasks and begin dialing configured peers
    pub async fn start(config: NodeConfig) -> Result<(Self, InboundStream), NodeError> {
        config.validate()?;

        let listener = Listener::bind(&config.listen)
            .await
            .map_err(|source| NodeError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let config = Arc::new(config);
        let launch_id = LaunchId::generate();
        let root = CancellationToken::new();
        let intake = root.child_token();
        let routing = RoutingTable::new(config.node_id);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);

        let (manager, handle) = ConnectionManager::new(
            config.clone(),
            launch_id,
            routing.clone(),
            inbound_tx.clone(),
            root.clone(),
        );

        let mut tasks = vec![
            tokio::spawn(manager.run()),
            tokio::spawn(accept_loop(listener, handle.clone(), intake.clone())),
        ];
        for peer in &config.peers {
            info!("Peer: {}", peer);
            tasks.push(tokio::spawn(dial_loop(
                handle.clone(),
                peer.clone(),
                intake.clone(),
            )));
        }

        info!(
            "Node {} ({}) listening on {}, launch {}",
            config.node_id, config.node_name, local_addr, launch_id
        );

        let node = Self {
            inner: Arc::new(Inner {
                trace_ids: TraceIdGenerator::new(config.node_id),
                config,
                launch_id,
                local_addr,
                routing,
                manager: handle,
                inbound: RwLock::new(Some(inbound_tx)),
                intake,
                root,
                tasks: Mutex::new(tasks),
            }),
        };

        Ok((node, ReceiverStream::new(inbound_rx)))
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn launch_id(&self) -> LaunchId {
        self.inner.launch_id
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Transport {
        self.inner.local_addr.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Fresh correlation id for an outgoing request
    pub fn next_correlation_id(&self) -> CorrelationId {
        self.inner.trace_ids.generate()
    }

    /// Route an envelope, waiting up to the send timeout for queue room
    pub async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        match self.route(&envelope)? {
            Route::Local => self.deliver_local(envelope).await,
            Route::Remote(conn) => Ok(conn.send(Frame::Data(envelope)).await?),
        }
    }

    /// Like [`Node::send`], but resolves only once the envelope has been
    /// written to the transport (or handed to the local inbound stream)
    pub async fn send_confirmed(&self, envelope: Envelope) -> Result<(), SendError> {
        match self.route(&envelope)? {
            Route::Local => self.deliver_local(envelope).await,
            Route::Remote(conn) => Ok(conn.send_confirmed(Frame::Data(envelope)).await?),
        }
    }

    fn route(&self, envelope: &Envelope) -> Result<Route, SendError> {
        if self.inner.intake.is_cancelled() {
            return Err(ConnectionError::Disconnected.into());
        }
        Ok(self.inner.routing.resolve(envelope.destination())?)
    }

    async fn deliver_local(&self, envelope: Envelope) -> Result<(), SendError> {
        let inbound = self
            .inner
            .inbound
            .read()
            .clone()
            .ok_or(ConnectionError::Disconnected)?;
        let timeout = self.inner.config.send_timeout;

        inbound
            .send_timeout(envelope, timeout)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    ConnectionError::Backpressure(timeout).into()
                }
                mpsc::error::SendTimeoutError::Closed(_) => ConnectionError::Disconnected.into(),
            })
    }

    /// Announce actors reachable through this node to every peer
    pub fn advertise(&self, addrs: impl IntoIterator<Item = ActorAddr>) {
        self.inner.manager.advertise(addrs.into_iter().collect());
    }

    /// Retract previously advertised actors
    pub fn withdraw(&self, addrs: impl IntoIterator<Item = ActorAddr>) {
        self.inner.manager.withdraw(addrs.into_iter().collect());
    }

    /// Peer join/loss notifications from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.manager.subscribe()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.inner.manager.topology()
    }

    pub fn peers(&self) -> Vec<PeerState> {
        self.topology().peers()
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.manager.stats()
    }

    /// Stop dialing and accepting, flush every connection and stop.
    ///
    /// Frames queued before this call are written ahead of the goodbye,
    /// within the configured grace period.
    pub async fn shutdown(&self) {
        if self.inner.intake.is_cancelled() {
            return;
        }
        info!("Node {} shutting down", self.node_id());
        self.inner.intake.cancel();

        let grace = self.inner.config.shutdown_grace;
        let topology = self.topology();
        let drains = topology
            .connections()
            .map(|conn| conn.drain("shutdown", grace));
        let flushed = futures::future::join_all(drains).await;

        let unflushed = flushed.iter().filter(|ok| !**ok).count();
        if unflushed > 0 {
            warn!("{} connections did not flush before shutdown", unflushed);
        }

        self.inner.root.cancel();
        self.inner.inbound.write().take();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Background tasks did not stop within {:?}", grace);
        }

        info!("Node {} stopped", self.node_id());
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("launch_id", &self.inner.launch_id)
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}
