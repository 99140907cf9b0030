//! Cluster router: ring maintenance, locality, peer channels.
//!
//! The router owns the current [`HashRing`] snapshot behind
//! `RwLock<Arc<_>>`: lookups clone the `Arc` and walk a stable snapshot;
//! membership changes build a fresh ring and swap the pointer, so readers
//! never block a rebuild.
//!
//! Peer gRPC channels are cached by address with lazy dials; a channel to a
//! departed node is dropped with the node, which also breaks any ownership
//! cycle between the ring and the channel set (both reference addresses,
//! not each other).

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::sync::Cache;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::discovery::{Peer, ServiceDiscovery};
use crate::ring::HashRing;
use crate::{ModelKey, MuninError, Result};

pub struct ClusterRouter {
    ring: RwLock<Arc<HashRing>>,
    local_id: String,
    replicas_per_model: usize,
    channels: Cache<String, Channel>,
    dial_timeout: Duration,
}

impl ClusterRouter {
    pub fn new(local_id: impl Into<String>, replicas_per_model: usize, grpc_timeout: Duration) -> Self {
        Self {
            ring: RwLock::new(Arc::new(HashRing::default())),
            local_id: local_id.into(),
            replicas_per_model,
            channels: Cache::builder()
                .max_capacity(256)
                .support_invalidation_closures()
                .build(),
            dial_timeout: grpc_timeout,
        }
    }

    /// Nodes responsible for `key`, primary first. Empty when the
    /// membership is empty.
    pub fn route(&self, key: &ModelKey) -> Vec<Peer> {
        self.snapshot().route(key, self.replicas_per_model)
    }

    pub fn is_local(&self, peer: &Peer) -> bool {
        peer.id == self.local_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Current ring snapshot; stable for the caller's lifetime.
    pub fn snapshot(&self) -> Arc<HashRing> {
        match self.ring.read() {
            Ok(guard) => Arc::clone(&guard),
            // A poisoned lock still holds a valid snapshot.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Rebuild the ring from a fresh membership listing and drop channels
    /// to departed nodes.
    pub fn update_membership(&self, peers: Vec<Peer>) {
        let ring = Arc::new(HashRing::build(peers));
        let live: HashSet<String> = ring.nodes().iter().map(|p| p.grpc_addr.clone()).collect();
        self.channels.invalidate_entries_if(move |addr, _| !live.contains(addr)).ok();

        let size = ring.nodes().len();
        match self.ring.write() {
            Ok(mut guard) => *guard = ring,
            Err(poisoned) => *poisoned.into_inner() = ring,
        }
        debug!(nodes = size, "ring rebuilt");
    }

    /// Cached lazy channel to a peer's cache gRPC port.
    pub fn channel(&self, peer: &Peer) -> Result<Channel> {
        let addr = peer.grpc_addr.clone();
        let timeout = self.dial_timeout;
        self.channels
            .try_get_with(addr.clone(), || -> Result<Channel> {
                let endpoint = Endpoint::from_shared(format!("http://{addr}"))
                    .map_err(|e| MuninError::Configuration(format!("bad peer address {addr}: {e}")))?
                    .timeout(timeout)
                    .connect_timeout(timeout);
                Ok(endpoint.connect_lazy())
            })
            .map_err(|e: Arc<MuninError>| e.duplicate())
    }

    /// Keep the ring in sync with discovery until shutdown: seed from a
    /// full listing, then re-list on every change notification.
    pub async fn run(
        self: Arc<Self>,
        discovery: Arc<dyn ServiceDiscovery>,
        shutdown: CancellationToken,
    ) {
        match discovery.list_peers().await {
            Ok(peers) => {
                info!(nodes = peers.len(), "initial membership");
                self.update_membership(peers);
            }
            Err(e) => warn!(error = %e, "initial membership listing failed"),
        }

        let mut notifications = match discovery.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "membership subscription failed; ring is frozen");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = notifications.recv() => {
                    if changed.is_none() {
                        warn!("membership subscription closed");
                        break;
                    }
                    match discovery.list_peers().await {
                        Ok(peers) => self.update_membership(peers),
                        Err(e) => warn!(error = %e, "membership listing failed"),
                    }
                }
            }
        }
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
    fn empty_router_routes_nowhere() {
        let router = ClusterRouter::new("n1", 2, Duration::from_secs(1));
        assert!(router.route(&ModelKey::new("resnet", "1")).is_empty());
    }

    #[test]
    fn locality_compares_ids() {
        let router = ClusterRouter::new("n1", 2, Duration::from_secs(1));
        assert!(router.is_local(&peer("n1")));
        assert!(!router.is_local(&peer("n2")));
    }

    #[test]
    fn membership_swap_changes_routes() {
        let router = ClusterRouter::new("n1", 1, Duration::from_secs(1));
        router.update_membership(vec![peer("n1")]);
        let key = ModelKey::new("resnet", "1");
        assert_eq!(router.route(&key)[0].id, "n1");

        router.update_membership(vec![peer("n2")]);
        assert_eq!(router.route(&key)[0].id, "n2");
    }
}
