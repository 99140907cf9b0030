//! Consistent-hash ring over the live membership.
//!
//! Each physical node contributes a fixed number of virtual points derived
//! from `xxh64(id + "|" + i)`; a key hashes to `xxh64(name + "@" + version)`
//! and the route is the clockwise walk collecting distinct physical nodes.
//! xxh64 with a zero seed is stable across nodes, platforms, and releases,
//! which is what keeps routing deterministic fleet-wide.
//!
//! A ring is immutable once built; membership changes build a new ring and
//! swap the snapshot pointer (see [`crate::cluster::ClusterRouter`]).

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use xxhash_rust::xxh64::xxh64;

use crate::discovery::Peer;
use crate::ModelKey;

/// Virtual points per physical node.
pub const VIRTUAL_NODES: usize = 100;

/// An immutable routing snapshot.
#[derive(Debug, Default)]
pub struct HashRing {
    points: BTreeMap<u64, usize>,
    nodes: Vec<Peer>,
}

impl HashRing {
    /// Build a ring from a membership set. Duplicate node ids collapse to
    /// one entry; vnode hash collisions keep the lexicographically smaller
    /// node id so every node builds the identical ring.
    pub fn build(mut peers: Vec<Peer>) -> Self {
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers.dedup_by(|a, b| a.id == b.id);

        let mut points = BTreeMap::new();
        for (idx, peer) in peers.iter().enumerate() {
            for vnode in 0..VIRTUAL_NODES {
                let hash = xxh64(format!("{}|{vnode}", peer.id).as_bytes(), 0);
                match points.entry(hash) {
                    Entry::Vacant(slot) => {
                        slot.insert(idx);
                    }
                    Entry::Occupied(mut slot) => {
                        if peer.id < peers[*slot.get()].id {
                            slot.insert(idx);
                        }
                    }
                }
            }
        }
        Self { points, nodes: peers }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Physical nodes in the ring, ordered by id.
    pub fn nodes(&self) -> &[Peer] {
        &self.nodes
    }

    /// The nodes responsible for `key`, primary first: up to `replicas`
    /// distinct physical nodes clockwise from the key's point. Pure in
    /// `key` for a fixed membership.
    pub fn route(&self, key: &ModelKey, replicas: usize) -> Vec<Peer> {
        if self.nodes.is_empty() || replicas == 0 {
            return Vec::new();
        }
        let want = replicas.min(self.nodes.len());
        let start = xxh64(key.to_string().as_bytes(), 0);

        let mut selected: Vec<usize> = Vec::with_capacity(want);
        for (_, &idx) in self.points.range(start..).chain(self.points.range(..start)) {
            if !selected.contains(&idx) {
                selected.push(idx);
                if selected.len() == want {
                    break;
                }
            }
        }
        selected.into_iter().map(|i| self.nodes[i].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> Peer {
        Peer {
            id: id.to_string(),
            grpc_addr: format!("{id}:8091"),
            rest_addr: format!("http://{id}:8081"),
        }
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        let ring = HashRing::build(Vec::new());
        assert!(ring.is_empty());
        assert!(ring.route(&ModelKey::new("resnet", "1"), 3).is_empty());
    }

    #[test]
    fn duplicate_ids_collapse() {
        let ring = HashRing::build(vec![peer("n1"), peer("n1"), peer("n2")]);
        assert_eq!(ring.nodes().len(), 2);
    }

    #[test]
    fn route_caps_at_membership_size() {
        let ring = HashRing::build(vec![peer("n1"), peer("n2")]);
        let route = ring.route(&ModelKey::new("resnet", "1"), 5);
        assert_eq!(route.len(), 2);
        assert_ne!(route[0].id, route[1].id);
    }
}
