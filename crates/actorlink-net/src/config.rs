//! Node configuration

use crate::connection::ConnectionSettings;
use crate::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::handshake::{VersionRange, PROTOCOL_VERSIONS};
use crate::transport::{Transport, TransportError};
use actorlink_core::NodeId;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("dead-peer interval ({dead_peer:?}) must exceed heartbeat interval ({heartbeat:?})")]
    DeadPeerTooShort {
        heartbeat: Duration,
        dead_peer: Duration,
    },
    #[error("backoff initial delay ({initial:?}) exceeds maximum ({max:?})")]
    BackoffRange { initial: Duration, max: Duration },
    #[error("empty protocol version range {min}..={max}")]
    VersionRange { min: u8, max: u8 },
    #[error("backoff jitter must be within [0, 1), got {0}")]
    Jitter(f64),
    #[error("invalid peer {0:?}: expected ADDRESS or ADDRESS@NODE_ID")]
    InvalidPeer(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reconnection delay policy
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the nominal delay that may be shaved off at random
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

/// A peer to keep a connection to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    pub transport: Transport,
    /// Node expected behind `transport`; a different node is rejected
    pub expected: Option<NodeId>,
}

impl PeerConfig {
    pub fn new(transport: impl Into<Transport>) -> Self {
        Self {
            transport: transport.into(),
            expected: None,
        }
    }

    pub fn expecting(mut self, node: NodeId) -> Self {
        self.expected = Some(node);
        self
    }
}

impl From<SocketAddr> for PeerConfig {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl From<Transport> for PeerConfig {
    fn from(transport: Transport) -> Self {
        Self::new(transport)
    }
}

impl FromStr for PeerConfig {
    type Err = ConfigError;

    /// Parse `ADDRESS` or `ADDRESS@NODE_ID`, where `ADDRESS` is a transport
    /// (`tcp://host:port`, `uds:///path`) or a bare `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ConfigError::InvalidPeer(s.to_string());
        let (target, expected) = match trimmed.rsplit_once('@') {
            Some((target, node)) if !node.is_empty() && node.bytes().all(|b| b.is_ascii_digit()) => {
                let node: u16 = node.parse().map_err(|_| invalid())?;
                (target, Some(NodeId::new(node).map_err(|_| invalid())?))
            }
            _ => (trimmed, None),
        };
        let transport = if target.contains("://") {
            target.parse()?
        } else {
            Transport::tcp(target)?
        };
        Ok(Self {
            transport,
            expected,
        })
    }
}

impl fmt::Display for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected {
            Some(node) => write!(f, "{}@{}", self.transport, node),
            None => write!(f, "{}", self.transport),
        }
    }
}

/// Everything a node needs to join a cluster
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Human readable name, announced in the handshake
    pub node_name: String,
    pub listen: Transport,
    pub peers: Vec<PeerConfig>,
    pub versions: VersionRange,
    pub capabilities: BTreeSet<String>,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub dead_peer_interval: Duration,
    /// How long a send may wait for room in a full queue
    pub send_timeout: Duration,
    /// How long shutdown waits for queued frames to flush
    pub shutdown_grace: Duration,
    /// Per-connection outbound queue capacity, in frames
    pub outbound_queue: usize,
    /// Local inbound stream capacity, in envelopes
    pub inbound_queue: usize,
    pub max_frame_size: usize,
    pub backoff: BackoffPolicy,
}

impl NodeConfig {
    /// Defaults for everything but identity and listen address
    pub fn new(node_id: NodeId, listen: impl Into<Transport>) -> Self {
        Self {
            node_id,
            node_name: format!("node-{node_id}"),
            listen: listen.into(),
            peers: Vec::new(),
            versions: PROTOCOL_VERSIONS,
            capabilities: BTreeSet::new(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            dead_peer_interval: Duration::from_secs(15),
            send_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            outbound_queue: 1024,
            inbound_queue: 4096,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_peer(mut self, peer: impl Into<PeerConfig>) -> Self {
        self.peers.push(peer.into());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("handshake timeout", self.handshake_timeout.is_zero()),
            ("heartbeat interval", self.heartbeat_interval.is_zero()),
            ("send timeout", self.send_timeout.is_zero()),
            ("outbound queue", self.outbound_queue == 0),
            ("inbound queue", self.inbound_queue == 0),
            ("max frame size", self.max_frame_size == 0),
            ("backoff initial delay", self.backoff.initial.is_zero()),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero(name));
        }

        if self.dead_peer_interval <= self.heartbeat_interval {
            return Err(ConfigError::DeadPeerTooShort {
                heartbeat: self.heartbeat_interval,
                dead_peer: self.dead_peer_interval,
            });
        }

        if self.versions.min > self.versions.max {
            return Err(ConfigError::VersionRange {
                min: self.versions.min,
                max: self.versions.max,
            });
        }

        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::BackoffRange {
                initial: self.backoff.initial,
                max: self.backoff.max,
            });
        }

        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Jitter(self.backoff.jitter));
        }

        Ok(())
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue_capacity: self.outbound_queue,
            send_timeout: self.send_timeout,
            heartbeat_interval: self.heartbeat_interval,
            dead_peer_interval: self.dead_peer_interval,
        }
    }
}
