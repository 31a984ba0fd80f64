//! Networking for actorlink nodes
//!
//! This crate provides:
//! - TCP and Unix domain socket transports
//! - Length-prefixed MessagePack framing
//! - The symmetric connection handshake
//! - Heartbeated connections with bounded outbound queues
//! - A connection manager with reconnecting dialers
//! - Snapshot-based routing of envelopes to peers
//! - The [`Node`] runtime tying it together

pub mod config;
pub mod connection;
mod dispatch;
pub mod framing;
pub mod handshake;
pub mod manager;
pub mod node;
pub mod peer;
pub mod routing;
pub mod snapshot;
pub mod topology;
pub mod transport;

pub use config::{BackoffPolicy, ConfigError, NodeConfig, PeerConfig};
pub use connection::{CloseReason, Connection, ConnectionError, ConnectionId, ConnectionState};
pub use framing::{Frame, FrameCodec, FrameType, ProtocolError};
pub use handshake::{HandshakeError, HandshakeInfo, VersionRange, PROTOCOL_VERSIONS};
pub use manager::{Backoff, ManagerStats};
pub use node::{InboundStream, Node, NodeError, SendError};
pub use peer::{Direction, PeerIdentity, PeerState};
pub use routing::{Route, RoutingError, RoutingSnapshot, RoutingTable};
pub use topology::{Topology, TopologyEvent};
pub use transport::{Transport, TransportError};
