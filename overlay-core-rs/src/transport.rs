//! Connection abstraction between the core and a concrete transport
//!
//! A [`Connection`] is the sending half of a per-peer queue. The transport
//! drains the matching receiver, writes each frame and reports completion
//! through the frame's `done` channel.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::frame::WireFrame;
use crate::types::NodeId;

/// Default depth of a per-connection send queue
pub const DEFAULT_SEND_QUEUE: usize = 64;

/// Transport failures reported back to the core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {0} closed")]
    Closed(NodeId),

    #[error("send to {peer} failed: {reason}")]
    SendFailed { peer: NodeId, reason: String },
}

/// A frame queued for sending, with its completion slot
#[derive(Debug)]
pub struct Outbound {
    pub frame: WireFrame,
    pub done: oneshot::Sender<Result<(), TransportError>>,
}

impl Outbound {
    /// Report the send outcome to whoever queued the frame
    pub fn complete(self, result: Result<(), TransportError>) {
        // The sender may have stopped waiting
        let _ = self.done.send(result);
    }
}

/// Sending handle for one peer
#[derive(Debug, Clone)]
pub struct Connection {
    peer: NodeId,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    /// Create a connection and the queue the transport must drain
    pub fn new(peer: NodeId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { peer, tx }, rx)
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a frame and wait until the transport reports completion
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        let (done, completed) = oneshot::channel();
        debug!("Queueing {} byte frame for {}", frame.len(), self.peer);

        self.tx
            .send(Outbound { frame, done })
            .await
            .map_err(|_| TransportError::Closed(self.peer.clone()))?;

        completed
            .await
            .map_err(|_| TransportError::Closed(self.peer.clone()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_waits_for_completion() {
        let peer = NodeId::parse("GW").unwrap();
        let (conn, mut rx) = Connection::new(peer.clone(), 4);

        let drain = tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            assert_eq!(out.frame, WireFrame::Text("[]".into()));
            out.complete(Err(TransportError::SendFailed {
                peer,
                reason: "socket reset".into(),
            }));
        });

        let result = conn.send(WireFrame::Text("[]".into())).await;
        assert!(matches!(result, Err(TransportError::SendFailed { .. })));
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_on_dropped_queue() {
        let (conn, rx) = Connection::new(NodeId::parse("GW").unwrap(), 4);
        drop(rx);

        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(WireFrame::Binary(vec![1])).await,
            Err(TransportError::Closed(_))
        ));
    }
}
