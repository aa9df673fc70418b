//! The peer directory: `node id -> endpoint`, immutable after bootstrap.

use std::collections::BTreeMap;

use lockstep_core::{NodeId, PeerInfo};

/// Mapping from peer id to reachable endpoint, built once from the
/// registry's registration response and never modified afterwards.
///
/// The interface is deliberately narrow so a future membership service
/// could replace it without touching the coordinator.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    entries: BTreeMap<NodeId, String>,
}

impl PeerDirectory {
    pub fn new(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        Self {
            entries: peers
                .into_iter()
                .map(|peer| (peer.id, peer.endpoint))
                .collect(),
        }
    }

    /// All peer ids, in ascending order.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    #[must_use]
    pub fn endpoint(&self, id: NodeId) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &str)> {
        self.entries.iter().map(|(id, endpoint)| (*id, endpoint.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_order() {
        let directory = PeerDirectory::new([
            PeerInfo {
                id: 3,
                endpoint: "node-c:7500".into(),
            },
            PeerInfo {
                id: 1,
                endpoint: "node-a:7500".into(),
            },
        ]);

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.peers().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(directory.endpoint(3), Some("node-c:7500"));
        assert_eq!(directory.endpoint(2), None);
    }
}
