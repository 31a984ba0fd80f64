//! Peer identity and information

use crate::handshake::Session;
use actorlink_core::{LaunchId, NodeId};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Which side opened the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}

/// Identity of the node at the other end of a connection, fixed at handshake
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub node_id: NodeId,
    pub launch_id: LaunchId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    /// Negotiated protocol version
    pub version: u8,
    pub direction: Direction,
    pub remote_addr: Option<SocketAddr>,
}

impl PeerIdentity {
    pub fn from_session(
        session: Session,
        direction: Direction,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            node_id: session.peer.node_id,
            launch_id: session.peer.launch_id,
            name: session.peer.node_name,
            capabilities: session.peer.capabilities,
            version: session.version,
            direction,
            remote_addr,
        }
    }

    /// Node that opened the transport
    pub fn initiator(&self, local: NodeId) -> NodeId {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => self.node_id,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.name, self.node_id, self.launch_id)
    }
}

/// Point-in-time view of a connected peer
#[derive(Clone, Debug)]
pub struct PeerState {
    pub identity: PeerIdentity,
    pub connection_id: crate::connection::ConnectionId,
    pub state: crate::connection::ConnectionState,
    /// Last time any frame arrived from the peer
    pub last_heard: Instant,
    /// Frames waiting in the outbound queue
    pub queue_depth: usize,
}
