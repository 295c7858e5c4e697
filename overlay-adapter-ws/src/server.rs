//! Listener for downstream hops
//!
//! A downstream hop connects to `{base}/{its node id}`; the last path
//! segment names the peer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
    },
};
use tracing::{debug, info, warn};

use overlay_core::{NodeId, OverlayNode};

use crate::config::WsConfig;
use crate::error::WsError;
use crate::link::serve_socket;

/// Peer node id from a request path such as `/ocpp/CS-001`
pub fn peer_from_path(path: &str) -> Result<NodeId, WsError> {
    let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    NodeId::parse(segment).map_err(|source| WsError::InvalidPeer {
        path: path.to_string(),
        source,
    })
}

/// Accepts WebSocket connections for one node
pub struct WsServer {
    node: Arc<OverlayNode>,
    listener: TcpListener,
    config: Arc<WsConfig>,
}

impl WsServer {
    pub async fn bind(node: Arc<OverlayNode>, addr: SocketAddr, config: WsConfig) -> Result<Self, WsError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for hops on {}", listener.local_addr()?);
        Ok(Self {
            node,
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WsError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), WsError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let node = self.node.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = accept(node, stream, &config).await {
                    warn!("Rejected connection from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn accept(node: Arc<OverlayNode>, stream: TcpStream, config: &WsConfig) -> Result<(), WsError> {
    let mut peer: Option<NodeId> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let id = match peer_from_path(path) {
            Ok(id) => id,
            Err(e) => {
                let mut error = ErrorResponse::new(Some(e.to_string()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                return Err(error);
            }
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match config.negotiate(offered).map(HeaderValue::from_str) {
            Some(Ok(protocol)) => {
                debug!("{} speaks {:?}", id, protocol);
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
            }
            _ => warn!("{} offered no supported subprotocol ({:?})", id, offered),
        }

        peer = Some(id);
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_frame_size),
        ..Default::default()
    };
    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

    let Some(peer) = peer else {
        return Ok(());
    };
    serve_socket(node, peer, ws).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_from_path() {
        assert_eq!(peer_from_path("/ocpp/CS-001").unwrap().as_str(), "CS-001");
        assert_eq!(peer_from_path("/CS-001/").unwrap().as_str(), "CS-001");
        assert!(peer_from_path("/").is_err());
        assert!(peer_from_path("/ocpp/bad%20id").is_err());
    }
}
