//! Configuration for an overlay hop
//!
//! Plain values, validated when the node is built.

use std::time::Duration;
use thiserror::Error;

use crate::envelope::DEFAULT_REQUEST_TIMEOUT;
use crate::forwarding::ForwardingResult;
use crate::signature::{verifying_key_from_hex, SignatureError, SignaturePolicy, SigningIdentity};
use crate::transport::DEFAULT_SEND_QUEUE;
use crate::types::{NodeId, NodeIdError};

/// Invalid node configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid node id {value:?}: {source}")]
    NodeId {
        value: String,
        #[source]
        source: NodeIdError,
    },

    #[error("invalid signature settings: {0}")]
    Signature(#[from] SignatureError),
}

/// Complete hop configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity of this hop
    pub node_id: String,

    /// Applied when no filter decides
    pub default_forwarding: ForwardingResult,

    /// Timeout for requests created through the node
    pub request_timeout: Duration,

    /// Reject requests whose path already visited this hop
    pub reject_loops: bool,

    pub signature: SignatureConfig,

    /// Static routes as (target, via)
    pub routes: Vec<(String, String)>,

    /// Next hop for destinations with no direct connection or static route
    pub default_route: Option<String>,

    /// Depth of each per-connection send queue
    pub send_queue: usize,
}

/// Signing keys and verification rules, keys given as hex
#[derive(Debug, Clone, Default)]
pub struct SignatureConfig {
    /// (key id, 32-byte seed)
    pub signing_keys: Vec<(String, String)>,

    /// (key id, 32-byte public key)
    pub trusted_keys: Vec<(String, String)>,

    pub required_keys: Vec<String>,
    pub require_outbound: bool,
    pub require_signatures: bool,
    pub reject_unknown_keys: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "overlay-node".to_string(),
            default_forwarding: ForwardingResult::Forward,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reject_loops: false,
            signature: SignatureConfig::default(),
            routes: Vec::new(),
            default_route: None,
            send_queue: DEFAULT_SEND_QUEUE,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the default forwarding result
    pub fn with_default_forwarding(mut self, result: ForwardingResult) -> Self {
        self.default_forwarding = result;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_loop_rejection(mut self, reject: bool) -> Self {
        self.reject_loops = reject;
        self
    }

    /// Sign outbound envelopes with this seed
    pub fn with_signing_key(mut self, key_id: impl Into<String>, seed_hex: impl Into<String>) -> Self {
        self.signature
            .signing_keys
            .push((key_id.into(), seed_hex.into()));
        self
    }

    pub fn with_trusted_key(mut self, key_id: impl Into<String>, public_hex: impl Into<String>) -> Self {
        self.signature
            .trusted_keys
            .push((key_id.into(), public_hex.into()));
        self
    }

    pub fn with_required_key(mut self, key_id: impl Into<String>) -> Self {
        self.signature.required_keys.push(key_id.into());
        self
    }

    /// Add a static route
    pub fn with_route(mut self, target: impl Into<String>, via: impl Into<String>) -> Self {
        self.routes.push((target.into(), via.into()));
        self
    }

    pub fn with_default_route(mut self, via: impl Into<String>) -> Self {
        self.default_route = Some(via.into());
        self
    }

    pub fn with_send_queue(mut self, depth: usize) -> Self {
        self.send_queue = depth.max(1);
        self
    }

    pub(crate) fn parsed_node_id(&self) -> Result<NodeId, ConfigError> {
        parse_id(&self.node_id)
    }

    pub(crate) fn parsed_routes(&self) -> Result<Vec<(NodeId, NodeId)>, ConfigError> {
        self.routes
            .iter()
            .map(|(target, via)| Ok((parse_id(target)?, parse_id(via)?)))
            .collect()
    }

    pub(crate) fn parsed_default_route(&self) -> Result<Option<NodeId>, ConfigError> {
        self.default_route.as_deref().map(parse_id).transpose()
    }
}

impl SignatureConfig {
    /// Build the runtime policy, loading all key material
    pub fn build(&self) -> Result<SignaturePolicy, SignatureError> {
        let mut policy = SignaturePolicy::new()
            .require_outbound(self.require_outbound)
            .require_signatures(self.require_signatures)
            .reject_unknown_keys(self.reject_unknown_keys);

        for (key_id, seed) in &self.signing_keys {
            policy = policy.with_signer(SigningIdentity::from_seed_hex(key_id.clone(), seed)?);
        }
        for (key_id, public) in &self.trusted_keys {
            policy = policy.with_trusted_key(key_id.clone(), verifying_key_from_hex(key_id, public)?);
        }
        for key_id in &self.required_keys {
            policy = policy.with_required_key(key_id.clone());
        }

        Ok(policy)
    }
}

fn parse_id(value: &str) -> Result<NodeId, ConfigError> {
    NodeId::parse(value).map_err(|source| ConfigError::NodeId {
        value: value.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("LC-1")
            .with_default_forwarding(ForwardingResult::Reject)
            .with_request_timeout(Duration::from_secs(5))
            .with_route("CS9", "GW")
            .with_default_route("CSMS")
            .with_send_queue(0);

        assert_eq!(config.parsed_node_id().unwrap().as_str(), "LC-1");
        assert_eq!(config.default_forwarding, ForwardingResult::Reject);
        assert_eq!(config.send_queue, 1);
        assert_eq!(config.parsed_routes().unwrap().len(), 1);
        assert_eq!(config.parsed_default_route().unwrap().unwrap().as_str(), "CSMS");
    }

    #[test]
    fn test_invalid_ids_are_reported() {
        assert!(matches!(
            NodeConfig::new("bad id").parsed_node_id(),
            Err(ConfigError::NodeId { .. })
        ));
        assert!(NodeConfig::new("A").with_route("B", "").parsed_routes().is_err());
    }

    #[test]
    fn test_signature_config_builds_policy() {
        let identity = SigningIdentity::from_seed_hex("K1", SEED).unwrap();
        let config = NodeConfig::new("A")
            .with_signing_key("K1", SEED)
            .with_trusted_key("K2", identity.public_key_hex())
            .with_required_key("K2");

        let policy = config.signature.build().unwrap();
        assert_eq!(policy.signer_ids().collect::<Vec<_>>(), vec!["K1"]);

        let broken = NodeConfig::new("A").with_trusted_key("K3", "00ff");
        assert!(broken.signature.build().is_err());
    }
}
