//! Uplink to a parent hop
//!
//! Connects to `{url}/{local node id}` offering the OCPP subprotocols, serves
//! the link until it drops and reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
    },
};
use tracing::{error, info, warn};

use overlay_core::{NodeId, OverlayNode};

use crate::config::{UplinkConfig, WsConfig};
use crate::error::WsError;
use crate::link::serve_socket;

/// Build the full WebSocket URL for a node
pub fn build_url(base_url: &str, node_id: &NodeId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

/// Keep an uplink connected for as long as the task runs.
///
/// Only returns on configuration errors.
pub async fn run_uplink(node: Arc<OverlayNode>, uplink: UplinkConfig, config: WsConfig) -> Result<(), WsError> {
    let peer = NodeId::parse(&uplink.peer).map_err(|source| WsError::InvalidPeer {
        path: uplink.peer.clone(),
        source,
    })?;
    let url = build_url(&uplink.url, node.id());

    let mut reconnect_delay = config.reconnect_delay;

    loop {
        info!("Connecting to {}: {}", peer, url);

        match connect_and_serve(&node, &peer, &url, &config).await {
            Ok(()) => {
                info!("Uplink to {} closed", peer);
                reconnect_delay = config.reconnect_delay;
            }
            Err(WsError::InvalidUrl(url)) => return Err(WsError::InvalidUrl(url)),
            Err(e) => {
                error!("Uplink to {} failed: {}", peer, e);
            }
        }

        // Exponential backoff
        info!("Reconnecting to {} in {:?}", peer, reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = next_delay(reconnect_delay, config.max_reconnect_delay);
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

async fn connect_and_serve(
    node: &Arc<OverlayNode>,
    peer: &NodeId,
    url: &str,
    config: &WsConfig,
) -> Result<(), WsError> {
    let mut request = url
        .into_client_request()
        .map_err(|_| WsError::InvalidUrl(url.to_string()))?;
    let offer =
        HeaderValue::from_str(&config.subprotocol_offer()).map_err(|_| WsError::InvalidUrl(url.to_string()))?;
    request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, offer);

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_frame_size),
        ..Default::default()
    };

    let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false).await?;

    // Verify subprotocol
    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());

    match accepted_protocol {
        Some(p) if config.subprotocols.iter().any(|ours| ours == p) => {
            info!("WebSocket connected to {} ({})", url, p);
        }
        other => {
            warn!("{} did not accept an OCPP subprotocol, got: {:?}", peer, other);
        }
    }

    serve_socket(node.clone(), peer.clone(), ws_stream).await;
    Ok(())
}
