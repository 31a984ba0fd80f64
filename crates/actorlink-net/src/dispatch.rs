//! Inbound frame dispatch
//!
//! Envelopes addressed to this node go to the local inbound stream. Others
//! are forwarded along the routing table, never back over the connection
//! they came from.

use crate::connection::Connection;
use crate::framing::{Frame, TopologyUpdate};
use crate::manager::ManagerEvent;
use crate::routing::{Route, RoutingTable};
use actorlink_core::{Envelope, NodeId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone)]
pub(crate) struct Dispatcher {
    local: NodeId,
    inbound: mpsc::Sender<Envelope>,
    routing: RoutingTable,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl Dispatcher {
    pub(crate) fn new(
        local: NodeId,
        inbound: mpsc::Sender<Envelope>,
        routing: RoutingTable,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            local,
            inbound,
            routing,
            events,
        }
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<ManagerEvent> {
        self.events.clone()
    }

    pub(crate) async fn on_envelope(&self, from: &Arc<Connection>, envelope: Envelope) {
        let destination = envelope.destination();
        if destination.is_on(self.local) {
            self.deliver(envelope).await;
            return;
        }

        match self.routing.resolve(destination) {
            Ok(Route::Local) => self.deliver(envelope).await,
            Ok(Route::Remote(next)) if next.id() == from.id() => {
                warn!(
                    "Dropping envelope {} for {}: route leads back to node {}",
                    envelope.correlation_id(),
                    destination,
                    from.peer().node_id
                );
            }
            Ok(Route::Remote(next)) => {
                let correlation_id = envelope.correlation_id();
                if let Err(err) = next.send(Frame::Data(envelope)).await {
                    warn!(
                        "Failed to forward envelope {} to node {}: {}",
                        correlation_id,
                        next.peer().node_id,
                        err
                    );
                }
            }
            Err(err) => {
                warn!(
                    "Dropping envelope {} from node {}: {}",
                    envelope.correlation_id(),
                    from.peer().node_id,
                    err
                );
            }
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        if self.inbound.send(envelope).await.is_err() {
            debug!("Inbound stream dropped, discarding envelope");
        }
    }

    pub(crate) fn on_topology(&self, from: &Arc<Connection>, update: TopologyUpdate) {
        let _ = self.events.send(ManagerEvent::Topology {
            conn: from.clone(),
            update,
        });
    }
}
