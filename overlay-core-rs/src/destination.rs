//! Routing target of a request

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::path::NetworkPath;
use crate::types::NodeId;

/// Where a request should go: a specific node, or along an explicit path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Destination {
    Node(NodeId),
    Path(NetworkPath),
}

impl Destination {
    pub fn node(id: NodeId) -> Self {
        Destination::Node(id)
    }

    pub fn path(path: NetworkPath) -> Self {
        Destination::Path(path)
    }

    /// Final addressee of the request
    pub fn target(&self) -> &NodeId {
        match self {
            Destination::Node(id) => id,
            Destination::Path(path) => path.last(),
        }
    }

    /// True if a node with id `local` is the final addressee
    pub fn is_for(&self, local: &NodeId) -> bool {
        let target = self.target();
        target == local || target.is_any()
    }

    /// Next node to hand the request to, seen from `local`.
    ///
    /// For an explicit path this is the element after `local`, or the first
    /// element when `local` is not on the path. Returns `None` when `local`
    /// is already the end of the route.
    pub fn next_hop_after(&self, local: &NodeId) -> Option<&NodeId> {
        match self {
            Destination::Node(id) => {
                if id == local || id.is_zero() {
                    None
                } else {
                    Some(id)
                }
            }
            Destination::Path(path) => match path.position(local) {
                Some(index) => path.get(index + 1),
                None => path.get(0),
            },
        }
    }
}

impl From<NodeId> for Destination {
    fn from(id: NodeId) -> Self {
        Destination::Node(id)
    }
}

impl From<NetworkPath> for Destination {
    fn from(path: NetworkPath) -> Self {
        Destination::Path(path)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Node(id) => write!(f, "{}", id),
            Destination::Path(path) => write!(f, "via [{}]", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[test]
    fn test_node_destination() {
        let dest = Destination::node(id("CSMS"));
        assert_eq!(dest.target(), &id("CSMS"));
        assert!(dest.is_for(&id("CSMS")));
        assert!(!dest.is_for(&id("GW")));
        assert_eq!(dest.next_hop_after(&id("GW")), Some(&id("CSMS")));
        assert_eq!(dest.next_hop_after(&id("CSMS")), None);
    }

    #[test]
    fn test_path_destination_next_hop() {
        let dest = Destination::path(NetworkPath::parse(&["LC", "GW", "CSMS"]).unwrap());

        assert_eq!(dest.target(), &id("CSMS"));
        assert_eq!(dest.next_hop_after(&id("CS1")), Some(&id("LC")));
        assert_eq!(dest.next_hop_after(&id("LC")), Some(&id("GW")));
        assert_eq!(dest.next_hop_after(&id("GW")), Some(&id("CSMS")));
        assert_eq!(dest.next_hop_after(&id("CSMS")), None);
    }

    #[test]
    fn test_any_destination() {
        let dest = Destination::node(NodeId::any());
        assert!(dest.is_for(&id("whoever")));
    }

    #[test]
    fn test_json_form() {
        let dest = Destination::node(id("C"));
        assert_eq!(serde_json::to_string(&dest).unwrap(), r#"{"node":"C"}"#);

        let dest: Destination = serde_json::from_str(r#"{"path":["A","B"]}"#).unwrap();
        assert_eq!(dest.target(), &id("B"));
    }
}
