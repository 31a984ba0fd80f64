//! Cluster membership as seen from one node

use crate::connection::{CloseReason, Connection};
use crate::peer::PeerState;
use actorlink_core::digest::{topology_digest, DIGEST_LEN};
use actorlink_core::{LaunchId, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Change in the set of connected peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    PeerJoined {
        node: NodeId,
        launch_id: LaunchId,
        name: String,
    },
    PeerLost {
        node: NodeId,
        launch_id: LaunchId,
        reason: CloseReason,
    },
}

/// Immutable snapshot of connected peers
#[derive(Clone, Debug)]
pub struct Topology {
    generation: u64,
    local: (NodeId, LaunchId),
    peers: BTreeMap<NodeId, Arc<Connection>>,
}

impl Topology {
    pub(crate) fn new(local: NodeId, launch_id: LaunchId) -> Self {
        Self {
            generation: 0,
            local: (local, launch_id),
            peers: BTreeMap::new(),
        }
    }

    pub(crate) fn with_peers(&self, peers: BTreeMap<NodeId, Arc<Connection>>) -> Self {
        Self {
            generation: self.generation + 1,
            local: self.local,
            peers,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_node(&self) -> NodeId {
        self.local.0
    }

    /// Live state of every connected peer, ordered by node id
    pub fn peers(&self) -> Vec<PeerState> {
        self.peers.values().map(|conn| conn.snapshot()).collect()
    }

    pub fn peer(&self, node: NodeId) -> Option<PeerState> {
        self.peers.get(&node).map(|conn| conn.snapshot())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.peers.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub(crate) fn connection(&self, node: NodeId) -> Option<&Arc<Connection>> {
        self.peers.get(&node)
    }

    pub(crate) fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.peers.values()
    }

    /// Digest over this node and every connected incarnation
    pub fn digest(&self) -> actorlink_core::Result<[u8; DIGEST_LEN]> {
        let mut members: Vec<_> = self
            .peers
            .values()
            .map(|conn| (conn.peer().node_id, conn.peer().launch_id))
            .collect();
        members.push(self.local);
        topology_digest(&members)
    }
}
