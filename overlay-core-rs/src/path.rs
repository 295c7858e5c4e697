//! Network path: the ordered record of hops a message has travelled
//!
//! Paths are persistent values. [`NetworkPath::append`] never mutates the
//! receiver, it returns a new path sharing nothing mutable with the old one.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{NodeId, NodeIdError, ZERO_NODE};

/// Error from parsing a network path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid node id at hop {index}: {source}")]
pub struct PathError {
    pub index: usize,
    #[source]
    pub source: NodeIdError,
}

/// Ordered sequence of hops, oldest first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkPath {
    hops: Arc<[NodeId]>,
}

impl NetworkPath {
    /// The empty path
    pub fn empty() -> Self {
        Self {
            hops: Arc::from(Vec::new()),
        }
    }

    /// Single-hop path, used by an originating node
    pub fn from_node(node: NodeId) -> Self {
        Self {
            hops: Arc::from(vec![node]),
        }
    }

    /// Build a path by appending every node in order
    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        nodes
            .into_iter()
            .fold(Self::empty(), |path, node| path.append(node))
    }

    /// Parse a path from its serialized list of node ids
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, PathError> {
        let mut hops = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let node = NodeId::parse(item.as_ref()).map_err(|source| PathError { index, source })?;
            hops.push(node);
        }
        Ok(Self { hops: hops.into() })
    }

    /// Serialize to the ordered list of node id strings
    pub fn to_strings(&self) -> Vec<String> {
        self.hops.iter().map(|n| n.as_str().to_string()).collect()
    }

    /// Return a path with `node` appended.
    ///
    /// Appending the current tail again returns the same path, so a hop that
    /// retries does not bloat the path.
    pub fn append(&self, node: NodeId) -> Self {
        if node.is_zero() || *self.last() == node {
            return self.clone();
        }
        let mut hops = Vec::with_capacity(self.hops.len() + 1);
        hops.extend(self.hops.iter().cloned());
        hops.push(node);
        Self { hops: hops.into() }
    }

    /// First hop, or the zero sentinel if empty
    pub fn source(&self) -> &NodeId {
        self.hops.first().unwrap_or(&ZERO_NODE)
    }

    /// Most recent relaying hop, or the zero sentinel if empty
    pub fn last(&self) -> &NodeId {
        self.hops.last().unwrap_or(&ZERO_NODE)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NodeId> {
        self.hops.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.hops.iter()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.hops.contains(node)
    }

    /// Index of the first occurrence of `node`
    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.hops.iter().position(|n| n == node)
    }

    /// True if any node appears more than once
    pub fn has_loop(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.hops.len());
        !self.hops.iter().all(|n| seen.insert(n))
    }
}

impl Default for NetworkPath {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "[]");
        }
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", hop)?;
        }
        Ok(())
    }
}

impl Serialize for NetworkPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.hops.iter())
    }
}

impl<'de> Deserialize<'de> for NetworkPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        Self::parse(&items).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[test]
    fn test_empty_path_sentinels() {
        let path = NetworkPath::empty();
        assert_eq!(path.len(), 0);
        assert!(path.source().is_zero());
        assert!(path.last().is_zero());
    }

    #[test]
    fn test_append_is_persistent() {
        let a = NetworkPath::from_node(id("A"));
        let ab = a.append(id("B"));

        assert_eq!(a.len(), 1);
        assert_eq!(ab.len(), 2);
        assert_eq!(ab.source(), &id("A"));
        assert_eq!(ab.last(), &id("B"));
    }

    #[test]
    fn test_append_tail_is_idempotent() {
        let path = NetworkPath::from_node(id("A")).append(id("B"));
        let again = path.append(id("B"));
        assert_eq!(path, again);
        assert_eq!(again.len(), 2);

        // Only the tail is deduplicated
        let back = again.append(id("A"));
        assert_eq!(back.len(), 3);
        assert!(back.has_loop());
    }

    #[test]
    fn test_parse_rejects_invalid_hop() {
        let err = NetworkPath::parse(&["A", "bad id", "C"]).unwrap_err();
        assert_eq!(err.index, 1);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let ab = NetworkPath::parse(&["A", "B"]).unwrap();
        let abc = NetworkPath::parse(&["A", "B", "C"]).unwrap();
        let ac = NetworkPath::parse(&["A", "C"]).unwrap();

        assert!(ab < abc);
        assert!(abc < ac);
        assert!(NetworkPath::empty() < ab);
    }

    #[test]
    fn test_json_form() {
        let path = NetworkPath::parse(&["CS1", "LC1"]).unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"["CS1","LC1"]"#);

        let parsed: NetworkPath = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, path);
        assert!(serde_json::from_str::<NetworkPath>(r#"["CS1",""]"#).is_err());
    }

    #[test]
    fn test_display() {
        let path = NetworkPath::parse(&["A", "B"]).unwrap();
        assert_eq!(path.to_string(), "A -> B");
        assert_eq!(NetworkPath::empty().to_string(), "[]");
    }
}
