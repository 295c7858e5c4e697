//! Core identifier types for the overlay network

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a node identifier
pub const MAX_NODE_ID_LEN: usize = 128;

/// Text form of the "any node" sentinel
pub const ANY_NODE: &str = "*";

/// Errors produced when parsing a node identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeIdError {
    #[error("node id is empty")]
    Empty,

    #[error("node id is {0} characters long (max {MAX_NODE_ID_LEN})")]
    TooLong(usize),

    #[error("invalid character {ch:?} in node id {id:?}")]
    InvalidChar { id: String, ch: char },
}

/// Identifier of an overlay participant (charging station, local controller,
/// gateway, CSMS).
///
/// The empty id is the "zero" sentinel returned by [`crate::NetworkPath`]
/// accessors on an empty path. It can never be produced by [`NodeId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

pub(crate) static ZERO_NODE: NodeId = NodeId(String::new());

impl NodeId {
    /// Parse and validate a node identifier
    pub fn parse(s: &str) -> Result<Self, NodeIdError> {
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }
        if s == ANY_NODE {
            return Ok(Self::any());
        }
        if s.len() > MAX_NODE_ID_LEN {
            return Err(NodeIdError::TooLong(s.len()));
        }
        if let Some(ch) = s.chars().find(|c| !Self::valid_char(*c)) {
            return Err(NodeIdError::InvalidChar {
                id: s.to_string(),
                ch,
            });
        }
        Ok(Self(s.to_string()))
    }

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '/' | '-')
    }

    /// The zero sentinel
    pub fn zero() -> Self {
        ZERO_NODE.clone()
    }

    /// The "any node" sentinel: whichever node receives it handles it
    pub fn any() -> Self {
        Self(ANY_NODE.to_string())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_any(&self) -> bool {
        self.0 == ANY_NODE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "<zero>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Correlation key of an in-flight call
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random request id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cross-cutting id used to follow one business event through the logs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventTrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EventTrackingId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        let id = NodeId::parse("CS001").unwrap();
        assert_eq!(id.as_str(), "CS001");
        assert!(!id.is_zero());

        assert!(NodeId::parse("csms.example.org:gw-1").is_ok());
        assert!(NodeId::parse("*").unwrap().is_any());
    }

    #[test]
    fn test_node_id_rejects_invalid() {
        assert_eq!(NodeId::parse(""), Err(NodeIdError::Empty));
        assert!(matches!(
            NodeId::parse("has space"),
            Err(NodeIdError::InvalidChar { ch: ' ', .. })
        ));
        let long = "a".repeat(MAX_NODE_ID_LEN + 1);
        assert_eq!(NodeId::parse(&long), Err(NodeIdError::TooLong(MAX_NODE_ID_LEN + 1)));
    }

    #[test]
    fn test_node_id_serde() {
        let id: NodeId = serde_json::from_str("\"GW-7\"").unwrap();
        assert_eq!(id.as_str(), "GW-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"GW-7\"");
        assert!(serde_json::from_str::<NodeId>("\"\"").is_err());
    }

    #[test]
    fn test_zero_sentinel() {
        let zero = NodeId::zero();
        assert!(zero.is_zero());
        assert!(zero < NodeId::parse("A").unwrap());
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
