use overlay_core::NodeIdError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// WebSocket transport errors
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("invalid peer id in {path:?}: {source}")]
    InvalidPeer {
        path: String,
        #[source]
        source: NodeIdError,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
