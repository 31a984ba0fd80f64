//! Configuration for actorlinkd

use actorlink_core::{ActorAddr, GroupNo, NodeId};
use actorlink_net::{BackoffPolicy, NodeConfig, PeerConfig, Transport};
use anyhow::Context;
use clap::Parser;
use std::time::Duration;

/// actorlinkd - actor cluster bridge node
#[derive(Parser, Debug, Clone)]
#[command(name = "actorlinkd")]
#[command(about = "actorlink bridge node: joins a cluster and routes envelopes")]
pub struct Config {
    /// Node id, unique within the cluster
    #[arg(short, long, env = "ACTORLINK_NODE_ID")]
    pub node_id: u16,

    /// Node name announced to peers (defaults to node-<id>)
    #[arg(long, env = "ACTORLINK_NODE_NAME")]
    pub name: Option<String>,

    /// Listen address for peer connections (tcp://HOST:PORT or uds:///PATH)
    #[arg(short, long, default_value = "tcp://0.0.0.0:7400", env = "ACTORLINK_LISTEN")]
    pub listen: Transport,

    /// Peers to stay connected to: ADDRESS or ADDRESS@NODE_ID, where ADDRESS
    /// is tcp://HOST:PORT, uds:///PATH or a bare HOST:PORT
    #[arg(short, long = "peer", value_delimiter = ',', env = "ACTORLINK_PEERS")]
    pub peers: Vec<PeerConfig>,

    /// Capabilities announced in the handshake
    #[arg(long, value_delimiter = ',')]
    pub capabilities: Vec<String>,

    /// Local actors to advertise on startup (GROUP/SLOT)
    #[arg(long, value_delimiter = ',')]
    pub advertise: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "5000")]
    pub heartbeat_ms: u64,

    /// Silence after which a peer is considered dead, in milliseconds
    #[arg(long, default_value = "15000")]
    pub dead_peer_ms: u64,

    /// Handshake timeout in milliseconds
    #[arg(long, default_value = "10000")]
    pub handshake_timeout_ms: u64,

    /// Initial reconnect delay in milliseconds
    #[arg(long, default_value = "100")]
    pub backoff_initial_ms: u64,

    /// Maximum reconnect delay in milliseconds
    #[arg(long, default_value = "10000")]
    pub backoff_max_ms: u64,

    /// Echo every inbound envelope back to its sender
    #[arg(long)]
    pub echo: bool,

    /// Stats log interval in seconds
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?}, expected json or pretty", self.log_format);
        }
        if self.stats_interval_secs == 0 {
            anyhow::bail!("Stats interval must be greater than zero");
        }
        self.local_actors()?;
        self.node_config()?
            .validate()
            .context("Invalid node configuration")?;
        Ok(())
    }

    /// Build the node configuration from the command line
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let node_id = NodeId::new(self.node_id).context("Invalid node id")?;
        let mut config = NodeConfig::new(node_id, self.listen.clone());
        if let Some(name) = &self.name {
            config.node_name = name.clone();
        }
        config.peers = self.peers.clone();
        config.capabilities = self.capabilities.iter().cloned().collect();
        config.heartbeat_interval = Duration::from_millis(self.heartbeat_ms);
        config.dead_peer_interval = Duration::from_millis(self.dead_peer_ms);
        config.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            ..BackoffPolicy::default()
        };
        Ok(config)
    }

    /// Addresses of the `--advertise` actors on this node
    pub fn local_actors(&self) -> anyhow::Result<Vec<ActorAddr>> {
        let node_id = NodeId::new(self.node_id).context("Invalid node id")?;
        self.advertise
            .iter()
            .map(|actor| {
                let (group, slot) = actor
                    .split_once('/')
                    .with_context(|| format!("Invalid actor {actor:?}, expected GROUP/SLOT"))?;
                let group: u8 = group
                    .parse()
                    .with_context(|| format!("Invalid group in {actor:?}"))?;
                let slot: u64 = slot
                    .parse()
                    .with_context(|| format!("Invalid slot in {actor:?}"))?;
                let addr = ActorAddr::new(node_id, GroupNo::new(group)?, slot)?;
                Ok(addr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["actorlinkd"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--node-id", "3"]);
        assert!(config.validate().is_ok());

        let node = config.node_config().unwrap();
        assert_eq!(node.node_id.get(), 3);
        assert_eq!(node.node_name, "node-3");
        assert_eq!(node.listen, Transport::Tcp("0.0.0.0:7400".into()));
        assert!(node.peers.is_empty());
        assert_eq!(node.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_peers_repeated_and_delimited() {
        let config = parse(&[
            "--node-id",
            "1",
            "--peer",
            "10.0.0.2:7400@2",
            "--peer",
            "10.0.0.3:7400,tcp://10.0.0.4:7400@4",
            "--peer",
            "uds:///run/actorlink/b.sock@5",
        ]);
        let peers: Vec<String> = config.peers.iter().map(ToString::to_string).collect();
        assert_eq!(
            peers,
            vec![
                "tcp://10.0.0.2:7400@2",
                "tcp://10.0.0.3:7400",
                "tcp://10.0.0.4:7400@4",
                "uds:///run/actorlink/b.sock@5",
            ]
        );
    }

    #[test]
    fn test_listen_transport() {
        let config = parse(&["--node-id", "1", "--listen", "uds:///run/actorlink/a.sock"]);
        assert_eq!(
            config.node_config().unwrap().listen,
            Transport::Uds("/run/actorlink/a.sock".into())
        );
        for bad in ["0.0.0.0:7400", "udp://0.0.0.0:7400", "uds:///run/"] {
            let result = Config::try_parse_from(["actorlinkd", "--node-id", "1", "--listen", bad]);
            assert!(result.is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn test_bad_peer_rejected_by_parser() {
        let result = Config::try_parse_from(["actorlinkd", "--node-id", "1", "--peer", "nowhere"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(parse(&["--node-id", "0"]).validate().is_err());
        assert!(parse(&["--node-id", "1", "--log-format", "xml"])
            .validate()
            .is_err());
        assert!(parse(&["--node-id", "1", "--heartbeat-ms", "2000", "--dead-peer-ms", "1000"])
            .validate()
            .is_err());
        assert!(parse(&["--node-id", "1", "--advertise", "1-42"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_local_actors() {
        let config = parse(&["--node-id", "5", "--advertise", "1/42,2/7"]);
        let actors = config.local_actors().unwrap();
        assert_eq!(actors.len(), 2);
        assert!(actors.iter().all(|addr| addr.node().get() == 5));
        assert_eq!(actors[0].group().get(), 1);
        assert_eq!(actors[0].slot(), 42);
        assert_eq!(actors[1].slot(), 7);
    }
}
