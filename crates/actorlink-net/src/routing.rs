//! Destination resolution
//!
//! The routing table maps actor addresses to the connection that reaches
//! them. Lookups read an immutable [`RoutingSnapshot`]; the connection
//! manager is the only writer and publishes a new snapshot per change.
//!
//! Resolution order for an address:
//!
//! 1. an explicit entry (advertised by a peer or registered locally)
//! 2. the address's node, if it is connected
//! 3. the local node
//! 4. a node we were connected to and lost
//!
//! Anything else is an unknown destination.

use crate::connection::Connection;
use crate::framing::TopologyUpdate;
use crate::snapshot::SnapshotCell;
use actorlink_core::{ActorAddr, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Resolution failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route to {0}")]
    UnknownDestination(ActorAddr),
    #[error("route to {addr} is down: node {node} unavailable")]
    PeerUnavailable { addr: ActorAddr, node: NodeId },
}

/// Where an envelope goes next
#[derive(Clone, Debug)]
pub enum Route {
    Local,
    Remote(Arc<Connection>),
}

#[derive(Clone, Debug)]
enum Entry {
    Local,
    Via(Arc<Connection>),
    /// Advertised by a node that has since been lost
    Unavailable(NodeId),
}

/// Immutable view of the routing table
#[derive(Clone, Debug)]
pub struct RoutingSnapshot {
    generation: u64,
    local: NodeId,
    entries: HashMap<ActorAddr, Entry>,
    nodes: HashMap<NodeId, Arc<Connection>>,
    lost: HashSet<NodeId>,
}

impl RoutingSnapshot {
    fn new(local: NodeId) -> Self {
        Self {
            generation: 0,
            local,
            entries: HashMap::new(),
            nodes: HashMap::new(),
            lost: HashSet::new(),
        }
    }

    /// Bumped on every change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn resolve(&self, addr: ActorAddr) -> Result<Route, RoutingError> {
        let node = addr.node();

        match self.entries.get(&addr) {
            Some(Entry::Local) => return Ok(Route::Local),
            Some(Entry::Via(conn)) => return remote(addr, conn),
            Some(Entry::Unavailable(node)) => {
                return Err(RoutingError::PeerUnavailable { addr, node: *node })
            }
            None => {}
        }

        if let Some(conn) = self.nodes.get(&node) {
            return remote(addr, conn);
        }
        if node == self.local {
            return Ok(Route::Local);
        }
        if self.lost.contains(&node) {
            return Err(RoutingError::PeerUnavailable { addr, node });
        }
        Err(RoutingError::UnknownDestination(addr))
    }

    /// Addresses registered on this node
    pub fn local_addresses(&self) -> Vec<ActorAddr> {
        let mut addrs: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Local))
            .map(|(addr, _)| *addr)
            .collect();
        addrs.sort();
        addrs
    }

    /// Addresses currently reachable through `node`
    pub fn advertised_by(&self, node: NodeId) -> Vec<ActorAddr> {
        let mut addrs: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Via(conn) if conn.peer().node_id == node))
            .map(|(addr, _)| *addr)
            .collect();
        addrs.sort();
        addrs
    }

    fn remove_learned_from(&mut self, node: NodeId) {
        self.entries.retain(|_, entry| match entry {
            Entry::Local => true,
            Entry::Via(conn) => conn.peer().node_id != node,
            Entry::Unavailable(lost) => *lost != node,
        });
    }
}

fn remote(addr: ActorAddr, conn: &Arc<Connection>) -> Result<Route, RoutingError> {
    if conn.is_open() {
        Ok(Route::Remote(conn.clone()))
    } else {
        Err(RoutingError::PeerUnavailable {
            addr,
            node: conn.peer().node_id,
        })
    }
}

/// Shared handle to the routing table
#[derive(Clone, Debug)]
pub struct RoutingTable {
    cell: Arc<SnapshotCell<RoutingSnapshot>>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        Self {
            cell: Arc::new(SnapshotCell::new(RoutingSnapshot::new(local))),
        }
    }

    /// Current snapshot; unaffected by later changes
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.cell.load()
    }

    pub fn resolve(&self, addr: ActorAddr) -> Result<Route, RoutingError> {
        self.cell.load().resolve(addr)
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut RoutingSnapshot),
    {
        self.cell.update(|snapshot| {
            f(snapshot);
            snapshot.generation += 1;
        });
    }

    /// `conn` is now the connection to its node
    pub(crate) fn peer_joined(&self, conn: &Arc<Connection>) {
        let node = conn.peer().node_id;
        self.mutate(|s| {
            s.nodes.insert(node, conn.clone());
            s.lost.remove(&node);
            for entry in s.entries.values_mut() {
                let reroute = match entry {
                    Entry::Local => false,
                    Entry::Via(old) => old.peer().node_id == node,
                    Entry::Unavailable(lost) => *lost == node,
                };
                if reroute {
                    *entry = Entry::Via(conn.clone());
                }
            }
        });
    }

    /// The connection to `node` is gone and nothing replaced it
    pub(crate) fn peer_lost(&self, node: NodeId) {
        self.mutate(|s| {
            s.nodes.remove(&node);
            s.lost.insert(node);
            for entry in s.entries.values_mut() {
                if matches!(entry, Entry::Via(conn) if conn.peer().node_id == node) {
                    *entry = Entry::Unavailable(node);
                }
            }
        });
    }

    /// Apply an advertisement received over `conn`
    pub(crate) fn apply_update(&self, conn: &Arc<Connection>, update: &TopologyUpdate) {
        let node = conn.peer().node_id;
        self.mutate(|s| {
            if update.full {
                s.remove_learned_from(node);
            }
            for addr in &update.withdrawn {
                if matches!(s.entries.get(addr), Some(Entry::Via(c)) if c.peer().node_id == node) {
                    s.entries.remove(addr);
                }
            }
            for addr in &update.advertised {
                // local registrations win
                if !matches!(s.entries.get(addr), Some(Entry::Local)) {
                    s.entries.insert(*addr, Entry::Via(conn.clone()));
                }
            }
        });
    }

    pub(crate) fn register_local(&self, addrs: &[ActorAddr]) {
        self.mutate(|s| {
            for addr in addrs {
                s.entries.insert(*addr, Entry::Local);
            }
        });
    }

    pub(crate) fn unregister_local(&self, addrs: &[ActorAddr]) {
        self.mutate(|s| {
            for addr in addrs {
                if matches!(s.entries.get(addr), Some(Entry::Local)) {
                    s.entries.remove(addr);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{detached, settings};
    use crate::connection::CloseReason;
    use actorlink_core::GroupNo;

    fn node(n: u16) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn addr(n: u16, slot: u64) -> ActorAddr {
        ActorAddr::new(node(n), GroupNo::new(1).unwrap(), slot).unwrap()
    }

    fn advertise(addrs: Vec<ActorAddr>, full: bool) -> TopologyUpdate {
        TopologyUpdate {
            full,
            advertised: addrs,
            withdrawn: vec![],
        }
    }

    #[tokio::test]
    async fn test_resolve_order() {
        let table = RoutingTable::new(node(1));
        let (b, _rx, _ev) = detached(2, &settings());

        assert!(matches!(table.resolve(addr(1, 9)), Ok(Route::Local)));
        assert_eq!(
            table.resolve(addr(2, 9)).unwrap_err(),
            RoutingError::UnknownDestination(addr(2, 9))
        );

        table.peer_joined(&b);
        assert!(matches!(table.resolve(addr(2, 9)), Ok(Route::Remote(c)) if c.id() == b.id()));

        // node 3 actors reached through node 2
        table.apply_update(&b, &advertise(vec![addr(3, 1)], false));
        assert!(matches!(table.resolve(addr(3, 1)), Ok(Route::Remote(c)) if c.id() == b.id()));
        assert!(matches!(
            table.resolve(addr(3, 2)),
            Err(RoutingError::UnknownDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_local_registration_wins() {
        let table = RoutingTable::new(node(1));
        let (b, _rx, _ev) = detached(2, &settings());
        table.peer_joined(&b);

        table.register_local(&[addr(2, 5)]);
        table.apply_update(&b, &advertise(vec![addr(2, 5)], false));
        assert!(matches!(table.resolve(addr(2, 5)), Ok(Route::Local)));

        table.unregister_local(&[addr(2, 5)]);
        assert!(matches!(table.resolve(addr(2, 5)), Ok(Route::Remote(_))));
        assert!(table.snapshot().local_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_lost_peer_unavailable() {
        let table = RoutingTable::new(node(1));
        let (b, _rx, _ev) = detached(2, &settings());
        table.peer_joined(&b);
        table.apply_update(&b, &advertise(vec![addr(3, 1)], true));

        b.close(CloseReason::Eof);
        // closed but not yet processed by the manager
        assert_eq!(
            table.resolve(addr(2, 1)).unwrap_err(),
            RoutingError::PeerUnavailable {
                addr: addr(2, 1),
                node: node(2)
            }
        );

        table.peer_lost(node(2));
        assert!(matches!(
            table.resolve(addr(2, 1)),
            Err(RoutingError::PeerUnavailable { .. })
        ));
        assert_eq!(
            table.resolve(addr(3, 1)).unwrap_err(),
            RoutingError::PeerUnavailable {
                addr: addr(3, 1),
                node: node(2)
            }
        );

        // rejoin restores learned routes through the new connection
        let (b2, _rx2, _ev2) = detached(2, &settings());
        table.peer_joined(&b2);
        assert!(matches!(table.resolve(addr(3, 1)), Ok(Route::Remote(c)) if c.id() == b2.id()));
        assert!(matches!(table.resolve(addr(2, 1)), Ok(Route::Remote(_))));
    }

    #[tokio::test]
    async fn test_full_update_replaces() {
        let table = RoutingTable::new(node(1));
        let (b, _rx, _ev) = detached(2, &settings());
        table.peer_joined(&b);

        table.apply_update(&b, &advertise(vec![addr(3, 1), addr(3, 2)], true));
        table.apply_update(&b, &advertise(vec![addr(3, 3)], true));
        assert_eq!(table.snapshot().advertised_by(node(2)), vec![addr(3, 3)]);

        table.apply_update(
            &b,
            &TopologyUpdate {
                full: false,
                advertised: vec![addr(3, 4)],
                withdrawn: vec![addr(3, 3)],
            },
        );
        assert_eq!(table.snapshot().advertised_by(node(2)), vec![addr(3, 4)]);
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let table = RoutingTable::new(node(1));
        let (b, _rx, _ev) = detached(2, &settings());
        table.peer_joined(&b);

        let before = table.snapshot();
        table.apply_update(&b, &advertise(vec![addr(3, 1)], false));

        assert!(before.resolve(addr(3, 1)).is_err());
        assert!(table.resolve(addr(3, 1)).is_ok());
        assert!(table.snapshot().generation() > before.generation());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_whole_updates() {
        const BATCH: u64 = 32;

        let table = RoutingTable::new(node(1));
        let (b, _rx, _ev) = detached(2, &settings());
        table.peer_joined(&b);

        let writer = {
            let table = table.clone();
            let b = b.clone();
            tokio::spawn(async move {
                for round in 0..200u64 {
                    let addrs = (0..BATCH).map(|i| addr(3, round * BATCH + i)).collect();
                    table.apply_update(&b, &advertise(addrs, true));
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..3 {
            let table = table.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = table.snapshot();
                    let addrs = snapshot.advertised_by(node(2));
                    if addrs.is_empty() {
                        continue;
                    }
                    assert_eq!(addrs.len() as u64, BATCH);
                    let round = addrs[0].slot() / BATCH;
                    assert!(addrs.iter().all(|a| a.slot() / BATCH == round));
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
