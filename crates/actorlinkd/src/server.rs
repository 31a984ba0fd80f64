//! actorlinkd server - main service loop

use crate::config::Config;
use actorlink_core::Envelope;
use actorlink_net::{Node, NodeError, TopologyEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0:#}")]
    Config(#[from] anyhow::Error),
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    echoed: AtomicU64,
    echo_failures: AtomicU64,
    peers_joined: AtomicU64,
    peers_lost: AtomicU64,
}

/// Server state
pub struct Server {
    config: Config,
    counters: Counters,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run the node until [`Server::shutdown`] is called
    pub async fn run(&self) -> Result<(), ServerError> {
        let (node, mut inbound) = Node::start(self.config.node_config()?).await?;
        info!(
            "Node {} ({}) listening on {}, launch {}",
            node.node_id(),
            node.config().node_name,
            node.local_addr(),
            node.launch_id()
        );
        for peer in &self.config.peers {
            info!("Configured peer: {}", peer);
        }

        let actors = self.config.local_actors()?;
        if !actors.is_empty() {
            info!("Advertising {} local actors", actors.len());
            node.advertise(actors);
        }

        let mut events = node.subscribe();
        let period = Duration::from_secs(self.config.stats_interval_secs);
        let mut stats_ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down...");
                    break;
                }
                envelope = inbound.next() => match envelope {
                    Some(envelope) => self.on_envelope(&node, envelope).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.on_topology(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} topology events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = stats_ticker.tick() => {
                    let manager = node.stats();
                    let stats = self.stats();
                    info!(
                        "Stats: {} peers, {} received, {} echoed, {} dials, {} handshake failures, {} lost",
                        manager.connected,
                        stats.received,
                        stats.echoed,
                        manager.dial_attempts,
                        manager.handshake_failures,
                        manager.lost
                    );
                }
            }
        }

        node.shutdown().await;
        info!("Node {} stopped", node.node_id());
        Ok(())
    }

    async fn on_envelope(&self, node: &Node, envelope: Envelope) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Envelope {} -> {} ({}, {} bytes, corr {})",
            envelope.sender(),
            envelope.destination(),
            envelope.kind(),
            envelope.payload().len(),
            envelope.correlation_id()
        );

        if !self.config.echo {
            return;
        }
        let reply = envelope.reply(envelope.kind().clone(), envelope.payload().clone());
        match node.send(reply).await {
            Ok(()) => {
                self.counters.echoed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.echo_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Echo to {} failed: {}", envelope.sender(), e);
            }
        }
    }

    fn on_topology(&self, event: TopologyEvent) {
        match event {
            TopologyEvent::PeerJoined {
                node,
                launch_id,
                name,
            } => {
                self.counters.peers_joined.fetch_add(1, Ordering::Relaxed);
                info!("Peer {} ({}) joined, launch {}", node, name, launch_id);
            }
            TopologyEvent::PeerLost {
                node,
                launch_id,
                reason,
            } => {
                self.counters.peers_lost.fetch_add(1, Ordering::Relaxed);
                warn!("Peer {} (launch {}) lost: {}", node, launch_id, reason);
            }
        }
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            echoed: self.counters.echoed.load(Ordering::Relaxed),
            echo_failures: self.counters.echo_failures.load(Ordering::Relaxed),
            peers_joined: self.counters.peers_joined.load(Ordering::Relaxed),
            peers_lost: self.counters.peers_lost.load(Ordering::Relaxed),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub received: u64,
    pub echoed: u64,
    pub echo_failures: u64,
    pub peers_joined: u64,
    pub peers_lost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use actorlink_core::{ActorAddr, CorrelationId, GroupNo, MessageKind, NodeId};
    use actorlink_net::{BackoffPolicy, NodeConfig, Transport};
    use clap::Parser;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout};

    fn addr(node: u16, slot: u64) -> ActorAddr {
        ActorAddr::new(
            NodeId::new(node).unwrap(),
            GroupNo::new(1).unwrap(),
            slot,
        )
        .unwrap()
    }

    fn fast_node(node: u16) -> NodeConfig {
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut config = NodeConfig::new(NodeId::new(node).unwrap(), listen);
        config.heartbeat_interval = Duration::from_millis(100);
        config.dead_peer_interval = Duration::from_millis(500);
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(300),
            jitter: 0.2,
        };
        config
    }

    fn daemon_config(node: u16, peer: Transport, extra: &[&str]) -> Config {
        let node = node.to_string();
        let peer = format!("{peer}@1");
        let mut argv = vec![
            "actorlinkd",
            "--node-id",
            node.as_str(),
            "--listen",
            "tcp://127.0.0.1:0",
            "--peer",
            peer.as_str(),
            "--heartbeat-ms",
            "100",
            "--dead-peer-ms",
            "500",
            "--backoff-initial-ms",
            "50",
            "--backoff-max-ms",
            "300",
        ];
        argv.extend_from_slice(extra);
        Config::try_parse_from(argv).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_server_creation() {
        let config = Config::try_parse_from(["actorlinkd", "--node-id", "1"]).unwrap();
        let server = Server::new(config).unwrap();
        assert_eq!(server.stats(), ServerStats::default());

        let config = Config::try_parse_from(["actorlinkd", "--node-id", "0"]).unwrap();
        assert!(matches!(Server::new(config), Err(ServerError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_roundtrip() {
        let (client, mut inbound) = Node::start(fast_node(1)).await.unwrap();
        let server = Arc::new(
            Server::new(daemon_config(2, client.local_addr(), &["--echo"])).unwrap(),
        );
        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        let echo_node = NodeId::new(2).unwrap();
        eventually(|| client.topology().contains(echo_node)).await;
        eventually(|| server.stats().peers_joined == 1).await;

        let request = Envelope::new(
            addr(1, 1),
            addr(2, 9),
            MessageKind::new("ping").unwrap(),
            &b"hello"[..],
            CorrelationId(77),
        );
        client.send(request).await.unwrap();

        let echoed = timeout(Duration::from_secs(5), inbound.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.sender(), addr(2, 9));
        assert_eq!(echoed.destination(), addr(1, 1));
        assert_eq!(echoed.correlation_id(), CorrelationId(77));
        assert_eq!(echoed.kind().as_str(), "ping");
        assert_eq!(&echoed.payload()[..], b"hello");

        eventually(|| server.stats().echoed == 1).await;
        assert_eq!(server.stats().received, 1);

        server.shutdown();
        run.await.unwrap().unwrap();

        eventually(|| !client.topology().contains(echo_node)).await;
        client.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_advertised_actors_reach_peer() {
        let (client, _inbound) = Node::start(fast_node(1)).await.unwrap();
        let server = Arc::new(
            Server::new(daemon_config(2, client.local_addr(), &["--advertise", "3/5"])).unwrap(),
        );
        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        let actor = ActorAddr::new(NodeId::new(2).unwrap(), GroupNo::new(3).unwrap(), 5).unwrap();
        eventually(|| {
            client
                .routing()
                .snapshot()
                .advertised_by(NodeId::new(2).unwrap())
                .contains(&actor)
        })
        .await;

        server.shutdown();
        run.await.unwrap().unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen = format!("tcp://{}", taken.local_addr().unwrap());
        let config = Config::try_parse_from(["actorlinkd", "--node-id", "1", "--listen", listen.as_str()])
            .unwrap();
        let server = Server::new(config).unwrap();
        assert!(matches!(server.run().await, Err(ServerError::Node(NodeError::Bind { .. }))));
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let config =
            Config::try_parse_from(["actorlinkd", "--node-id", "1", "--listen", "tcp://127.0.0.1:0"])
                .unwrap();
        let server = Server::new(config).unwrap();
        server.shutdown();
        timeout(Duration::from_secs(10), server.run())
            .await
            .unwrap()
            .unwrap();
    }
}
