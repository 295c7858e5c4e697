//! In-process connection between two nodes
//!
//! Each direction is a pump task draining one node's send queue into the
//! other node's `on_frame`. Used by tests and demos in place of a socket.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::node::OverlayNode;
use crate::transport::{Outbound, TransportError};
use crate::types::NodeId;

/// A bidirectional in-memory link
pub struct MemoryLink {
    a: Arc<OverlayNode>,
    b: Arc<OverlayNode>,
    pumps: Vec<JoinHandle<()>>,
}

/// Connect `a` and `b` with each other
pub async fn link(a: &Arc<OverlayNode>, b: &Arc<OverlayNode>) -> MemoryLink {
    let a_to_b = a.attach(b.id().clone()).await;
    let b_to_a = b.attach(a.id().clone()).await;

    MemoryLink {
        a: a.clone(),
        b: b.clone(),
        pumps: vec![
            tokio::spawn(pump(a.id().clone(), a_to_b, b.clone())),
            tokio::spawn(pump(b.id().clone(), b_to_a, a.clone())),
        ],
    }
}

async fn pump(from: NodeId, mut outbound: mpsc::Receiver<Outbound>, target: Arc<OverlayNode>) {
    while let Some(Outbound { frame, done }) = outbound.recv().await {
        // Delivery into the peer's inbox counts as a completed send
        let _ = done.send(Ok::<(), TransportError>(()));
        target.on_frame(from.clone(), frame);
    }
    debug!("Memory link {} -> {} closed", from, target.id());
}

impl MemoryLink {
    /// Tear the link down; later sends on it fail with `Closed`
    pub async fn sever(self) {
        self.a.detach(self.b.id()).await;
        self.b.detach(self.a.id()).await;
        for pump in self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::outcome::ResultCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_link_carries_requests_and_replies() {
        let cs = OverlayNode::new(NodeConfig::new("CS1")).await.unwrap();
        let csms = OverlayNode::new(NodeConfig::new("CSMS")).await.unwrap();
        csms.register_handler("Heartbeat", |_| async { Ok(json!({"interval": 300})) });
        let _link = link(&cs, &csms).await;

        let response = cs
            .dispatch(cs.new_request("Heartbeat", csms.id().clone(), json!({})))
            .await;
        assert_eq!(response.result, ResultCode::Ok);
        assert_eq!(response.payload, json!({"interval": 300}));
    }

    #[tokio::test]
    async fn test_severed_link_has_no_route() {
        let cs = OverlayNode::new(NodeConfig::new("CS1")).await.unwrap();
        let csms = OverlayNode::new(NodeConfig::new("CSMS")).await.unwrap();
        link(&cs, &csms).await.sever().await;

        let response = cs
            .dispatch(cs.new_request("Heartbeat", csms.id().clone(), json!({})))
            .await;
        assert_eq!(response.result, ResultCode::Exception);
    }
}
