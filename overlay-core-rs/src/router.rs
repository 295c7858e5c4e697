//! Next-hop resolution
//!
//! Resolution order for a destination, seen from the local node:
//! 1. a live connection to the next hop itself
//! 2. a static route `target -> via` with a live connection to `via`
//! 3. the default route (usually the uplink towards the CSMS)

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::destination::Destination;
use crate::transport::Connection;
use crate::types::NodeId;

/// Connection table plus static routing
pub struct Router {
    local: NodeId,
    connections: RwLock<HashMap<NodeId, Connection>>,
    routes: RwLock<HashMap<NodeId, NodeId>>,
    default_route: RwLock<Option<NodeId>>,
}

impl Router {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            connections: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            default_route: RwLock::new(None),
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Register a live connection, replacing any previous one to the same peer
    pub async fn add_connection(&self, connection: Connection) {
        info!("Connection to {} registered", connection.peer());
        self.connections
            .write()
            .await
            .insert(connection.peer().clone(), connection);
    }

    pub async fn remove_connection(&self, peer: &NodeId) -> Option<Connection> {
        let removed = self.connections.write().await.remove(peer);
        if removed.is_some() {
            info!("Connection to {} removed", peer);
        }
        removed
    }

    /// Drop the entry for `peer` if its transport has gone away.
    /// A newer live connection to the same peer is left in place.
    pub async fn remove_closed(&self, peer: &NodeId) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(peer).is_some_and(Connection::is_closed) {
            connections.remove(peer);
            info!("Connection to {} closed", peer);
            return true;
        }
        false
    }

    pub async fn connection(&self, peer: &NodeId) -> Option<Connection> {
        self.connections
            .read()
            .await
            .get(peer)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    pub async fn peers(&self) -> Vec<NodeId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Route requests for `target` through `via`
    pub async fn add_route(&self, target: NodeId, via: NodeId) {
        debug!("Route {} via {}", target, via);
        self.routes.write().await.insert(target, via);
    }

    pub async fn set_default_route(&self, via: Option<NodeId>) {
        *self.default_route.write().await = via;
    }

    /// Connection to hand a request for `destination` to
    pub async fn next_hop(&self, destination: &Destination) -> Option<Connection> {
        let hop = destination.next_hop_after(&self.local)?;

        if let Some(conn) = self.connection(hop).await {
            return Some(conn);
        }

        let via = self.routes.read().await.get(hop).cloned();
        if let Some(via) = via {
            if let Some(conn) = self.connection(&via).await {
                return Some(conn);
            }
        }

        let default = self.default_route.read().await.clone();
        match default {
            Some(via) if via != self.local => self.connection(&via).await,
            _ => None,
        }
    }
}
