//! WebSocket transport configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Subprotocols offered and accepted, most preferred first
pub const OCPP_SUBPROTOCOLS: [&str; 2] = ["ocpp2.1", "ocpp1.6"];

/// An outbound connection to a parent hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkConfig {
    /// Node id of the peer at the other end
    pub peer: String,

    /// Base WebSocket URL (without our node id)
    pub url: String,
}

/// Complete WebSocket configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Accept downstream connections on this address
    pub listen: Option<SocketAddr>,

    pub uplinks: Vec<UplinkConfig>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    pub max_message_size: usize,
    pub max_frame_size: usize,

    pub subprotocols: Vec<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen: None,
            uplinks: Vec::new(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
            subprotocols: OCPP_SUBPROTOCOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl WsConfig {
    /// Listen for downstream hops
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Connect to `peer` at `url`
    pub fn with_uplink(mut self, peer: impl Into<String>, url: impl Into<String>) -> Self {
        self.uplinks.push(UplinkConfig {
            peer: peer.into(),
            url: url.into(),
        });
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Header value listing the offered subprotocols
    pub(crate) fn subprotocol_offer(&self) -> String {
        self.subprotocols.join(", ")
    }

    /// Pick the first of our subprotocols the client offered
    pub(crate) fn negotiate(&self, offered: &str) -> Option<&str> {
        let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
        self.subprotocols
            .iter()
            .map(String::as_str)
            .find(|ours| offered.contains(ours))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = WsConfig::default()
            .with_listen("127.0.0.1:9000".parse().unwrap())
            .with_uplink("CSMS", "ws://csms.local/ocpp")
            .with_reconnect(Duration::from_secs(10), Duration::from_secs(1));

        assert_eq!(config.uplinks[0].peer, "CSMS");
        assert_eq!(config.reconnect_delay, Duration::from_secs(10));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(10));
        assert_eq!(config.subprotocol_offer(), "ocpp2.1, ocpp1.6");
    }

    #[test]
    fn test_negotiate_prefers_our_order() {
        let config = WsConfig::default();
        assert_eq!(config.negotiate("ocpp1.6, ocpp2.1"), Some("ocpp2.1"));
        assert_eq!(config.negotiate("ocpp1.6"), Some("ocpp1.6"));
        assert_eq!(config.negotiate("ocpp2.0.1"), None);
    }
}
