//! Pump between a WebSocket stream and an overlay node

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use overlay_core::{NodeId, OverlayNode, TransportError, WireFrame};

/// Carry frames between `ws` and `node` until either side closes.
///
/// The connection is registered with the node's router for the duration;
/// frames still queued when the socket goes away fail with `Closed`.
pub async fn serve_socket<S>(node: Arc<OverlayNode>, peer: NodeId, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outbound = node.attach(peer.clone()).await;
    let (mut ws_tx, mut ws_rx) = ws.split();

    info!("Link to {} up", peer);

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(out) = queued else {
                    debug!("Send queue for {} replaced", peer);
                    break;
                };

                let message = match &out.frame {
                    WireFrame::Text(text) => Message::Text(text.clone().into()),
                    WireFrame::Binary(bytes) => Message::Binary(bytes.clone().into()),
                };

                match ws_tx.send(message).await {
                    Ok(()) => out.complete(Ok(())),
                    Err(e) => {
                        error!("Failed to send WebSocket message to {}: {}", peer, e);
                        out.complete(Err(TransportError::SendFailed {
                            peer: peer.clone(),
                            reason: e.to_string(),
                        }));
                        break;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        node.on_frame(peer.clone(), WireFrame::Text(text.to_string()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        node.on_frame(peer.clone(), WireFrame::Binary(data.to_vec()));
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by {}", peer);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream from {} ended", peer);
                        break;
                    }
                }
            }
        }
    }

    drop(outbound);
    let _ = ws_tx.close().await;
    node.router().remove_closed(&peer).await;
    info!("Link to {} down", peer);
}
